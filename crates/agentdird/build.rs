fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    // store and routing share the dir.v1 package; compile together so
    // relative imports resolve.
    tonic_build::configure().compile(&["proto/store.proto", "proto/routing.proto"], &["proto"])?;
    Ok(())
}
