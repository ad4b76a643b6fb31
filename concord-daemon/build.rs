fn main() {
    // Try to get short git commit hash.
    if let Ok(hash) = std::env::var("GIT_HASH") {
        println!("cargo:rustc-env=GIT_HASH={hash}");
    } else {
        rustc_tools_util::setup_version_info!();
    }
}
