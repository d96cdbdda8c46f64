fn main() -> libweld::error::Result {
    let args = libweld::args::Args::from_env()?;
    libweld::init_tracing();
    libweld::link(&args)
}
