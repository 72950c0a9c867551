fn main() {
    if let Err(err) = ambient_appearance_lib::run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
