use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure()
        .build_server(true)
        .compile(&["protos/tracker.proto"], &["protos"])?;
    Ok(())
}
