use std::env;

fn main() {
    // Nothing to link unless mounting through libfuse is enabled
    if env::var_os("CARGO_FEATURE_LIBFUSE").is_none() {
        return;
    }

    // OSXFUSE ships libfuse under a different name
    let name = match env::var("CARGO_CFG_TARGET_OS") {
        Ok(ref os) if os == "macos" => "osxfuse",
        _ => "fuse",
    };
    if let Err(err) = pkg_config::Config::new().atleast_version("2.6.0").probe(name) {
        panic!("Unable to find lib{} (needed by the `libfuse` feature): {}", name, err);
    }
}
