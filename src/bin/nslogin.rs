use env_logger::Env;
use log::debug;
use std::env;
use std::process;

use nslogin::exec::command_words;
use nslogin::launch::Launcher;

const RESTART_MSG: &str =
    "Please terminate this instance by running \"wsl -t <distro>\" from Windows shell and try again.";

fn main() {
    env_logger::Builder::from_env(Env::new().filter_or("NSLOGIN_LOG", "warn")).init();

    // No options of our own: everything is the command line to run.
    let args = command_words(env::args_os());

    let err = match Launcher::system().run(&args, env::var_os("SHELL")) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    debug!("{} stage failed: {:?}", err.stage(), err);
    if err.wants_restart() {
        eprintln!("nslogin: {}. {}", err, RESTART_MSG);
    } else {
        eprintln!("nslogin: {}", err);
    }
    process::exit(err.exit_code());
}
