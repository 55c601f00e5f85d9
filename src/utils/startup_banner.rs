const ANSI_RESET: &str = "\x1b[0m";
const ANSI_SAGE: &str = "\x1b[38;5;108m";
const ANSI_FAINT: &str = "\x1b[2;90m";

const WORDMARK: &str = r#"
           _           _          _
  ___ __ _| | ___  ___| | ___  __| | __ _  ___ _ __
 / __/ _` | |/ _ \/ __| |/ _ \/ _` |/ _` |/ _ \ '__|
 \__ \ (_| | |  __/\__ \ |  __/ (_| | (_| |  __/ |
 |___/\__,_|_|\___||___/_|\___|\__,_|\__, |\___|_|
                                     |___/          "#;

pub fn print_startup_banner() {
    let build_line = format!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("SALESLEDGER_BUILD_DATE_UTC"),
        env!("SALESLEDGER_BUILD_COMMIT")
    );

    println!("{ANSI_SAGE}{WORDMARK}{ANSI_RESET}");
    println!("{build_line}");
    println!("Tagged sales ledger server: rolling aggregates, day rotation, sale notifications.");
    println!("{ANSI_FAINT}Provided \"AS IS\" under the MIT License, without warranty.{ANSI_RESET}");
    println!("{}", "-".repeat(build_line.len().max(48)));
}
