pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;172m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
            _ _ _     _
  _ __ ___ (_) | |___| |_ _ __ ___  __ _ _ __ ___
 | '_ ` _ \| | | / __| __| '__/ _ \/ _` | '_ ` _ \
 | | | | | | | | \__ \ |_| | |  __/ (_| | | | | | |
 |_| |_| |_|_|_|_|___/\__|_|  \___|\__,_|_| |_| |_|
"#;
    const APP_DESCRIPTION: &str =
        "Manufacturing telemetry ingestion: device agent streams in, deduplicated storage out.";
    const WIRE_NOTICE: &str = "Frames are JSON arrays; every frame is answered with one status line.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("MILLSTREAM_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{WIRE_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
