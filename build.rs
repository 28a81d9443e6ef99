fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/viewtally.proto");
    tonic_build::compile_protos("proto/viewtally.proto")?;
    Ok(())
}
