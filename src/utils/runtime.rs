use std::process;

/// Signal handling and socket semantics assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: salesledger runs on POSIX systems only");
        process::exit(2);
    }
}
