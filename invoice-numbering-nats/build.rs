use anyhow::{Context, Result};
use std::{ffi::OsStr, path::PathBuf};
use walkdir::WalkDir;

const PROTO_DIR: &str = "proto";

fn main() -> Result<()> {
    let protos = WalkDir::new(PROTO_DIR)
        .into_iter()
        .map(|entry| {
            entry
                .map(|entry| entry.into_path())
                .context("cannot read entry of proto directory")
        })
        .filter(|path| {
            path.as_ref().map_or(true, |path| {
                path.extension().and_then(OsStr::to_str) == Some("proto")
            })
        })
        .collect::<Result<Vec<PathBuf>>>()?;

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    prost_build::Config::new()
        .compile_protos(&protos, &[PROTO_DIR])
        .context("cannot compile settings protos")
}
