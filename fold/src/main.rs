fn main() {
    if let Err(error) = run() {
        libfold::error::report_error_and_exit(&error);
    }
}

fn run() -> libfold::error::Result {
    match libfold::args::from_env()? {
        libfold::args::Action::Link(args) => libfold::run(&args),
        libfold::args::Action::Version => {
            println!("fold {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
