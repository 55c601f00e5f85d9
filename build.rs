use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let build_date = command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]);
    let commit = command_output("git", &["rev-parse", "--short", "HEAD"]);

    println!("cargo:rustc-env=SALESLEDGER_BUILD_DATE_UTC={build_date}");
    println!("cargo:rustc-env=SALESLEDGER_BUILD_COMMIT={commit}");
}

fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}
