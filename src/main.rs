fn main() {
    if let Err(err) = alienprobe_lib::run() {
        eprintln!("alienprobe: {err:#}");
        std::process::exit(1);
    }
}
