pub fn main() -> std::process::ExitCode {
    protopython::run()
}
