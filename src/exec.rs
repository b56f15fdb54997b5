//! Building and running the final command.

use log::debug;
use nix::unistd::{execvp, Uid, User};
use std::convert::Infallible;
use std::ffi::{CStr, CString, OsString};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;

use crate::error::Error;

const FALLBACK_SHELL: &str = "/bin/sh";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    program: CString,
    argv: Vec<CString>,
}

impl CommandSpec {
    /// `args` are the words after our own name. Without any, run `shell`
    /// with no arguments; otherwise the first word is the program and all
    /// of them are its argv, untouched.
    pub fn resolve(args: &[OsString], shell: OsString) -> Result<Self, Error> {
        let words = if args.is_empty() {
            vec![shell]
        } else {
            args.to_vec()
        };
        let argv = words
            .iter()
            .map(|w| CString::new(w.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CommandSpec {
            program: argv[0].clone(),
            argv,
        })
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Replace the process image. Only returns on failure.
    pub fn exec(&self) -> Result<Infallible, Error> {
        // The buffers do not survive the exec.
        flush("stdout", &mut io::stdout());
        flush("stderr", &mut io::stderr());
        execvp(&self.program, &self.argv).map_err(|source| Error::Exec {
            program: self.program.to_string_lossy().into_owned(),
            source,
        })
    }
}

fn flush(name: &str, stream: &mut dyn Write) -> bool {
    match stream.flush() {
        Ok(()) => true,
        Err(err) => {
            debug!("flushing {} before exec: {}", name, err);
            false
        }
    }
}

/// The words after our own name, exactly as given: there are no options,
/// not even `--`.
pub fn command_words<I: IntoIterator<Item = OsString>>(argv: I) -> Vec<OsString> {
    argv.into_iter().skip(1).collect()
}

/// `$SHELL` if set, else the passwd entry of `uid`, else `/bin/sh`.
pub fn login_shell(env_shell: Option<OsString>, uid: Uid) -> OsString {
    if let Some(shell) = env_shell.filter(|s| !s.is_empty()) {
        return shell;
    }
    match User::from_uid(uid) {
        Ok(Some(user)) if !user.shell.as_os_str().is_empty() => {
            debug!("SHELL unset, using {}'s login shell", user.name);
            user.shell.into_os_string()
        }
        _ => OsString::from(FALLBACK_SHELL),
    }
}
