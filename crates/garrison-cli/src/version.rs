//! `-v` and `-V` output.

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn print_version() {
    println!("garrison version: garrison/{VERSION}");
}

/// Version plus how this binary was built.
pub fn print_build_info() {
    print_version();
    println!("built for {}-{}", std::env::consts::ARCH, std::env::consts::OS);
    println!("profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    println!("rust version: 1.88+");
    println!("features: http/1.1, postgresql pool, binary upgrade");
}
