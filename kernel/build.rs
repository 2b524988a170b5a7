fn main() {
    println!("cargo:rustc-link-search=native={}", concat!(env!("CARGO_MANIFEST_DIR"), "/../build"));
    // The linker script only makes sense for the bare-metal target; host
    // builds of this package are not supported anyway.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!("cargo:rustc-link-arg=-Tlinker.ld");
    }
    println!("cargo:rerun-if-changed=../build/linker.ld");
}
