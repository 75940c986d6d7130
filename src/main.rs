fn main() -> std::process::ExitCode {
    hmp_launcher::run()
}
