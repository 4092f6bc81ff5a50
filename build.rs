use anyhow::{Context, Result};

fn main() -> Result<()> {
    tonic_build::configure()
        .out_dir("src/castapi")
        .compile(&["proto/castletown.proto"], &["proto"])
        .context("compile castletown protocol buffers")
}
