fn main() -> std::process::ExitCode {
    quest_wireless_adb_lib::run()
}
