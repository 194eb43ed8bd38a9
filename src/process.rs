//! Shell resolution for worker-spawned commands.

use anyhow::{Context, Result};
use nix::unistd::{Uid, User};
use std::ffi::OsString;

/// Resolves the shell a worker should use to run a command: `$SHELL` if it is set and non-empty,
/// otherwise the invoking user's login shell from the user database, otherwise `/bin/sh`.
///
/// # Errors
///
/// Returns an error if the user database cannot be queried.
pub fn resolve_shell() -> Result<OsString> {
    if let Some(shell) = std::env::var_os("SHELL") {
        if !shell.is_empty() {
            return Ok(shell);
        }
    }

    if let Some(user) =
        User::from_uid(Uid::current()).context("Error looking up current user")?
    {
        return Ok(user.shell.into_os_string());
    }

    Ok(OsString::from("/bin/sh"))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resolve_shell {
        use super::*;

        #[test]
        fn uses_shell_env_var_when_set() {
            // SAFETY: this test does not run concurrently with other tests that read `SHELL`.
            unsafe {
                std::env::set_var("SHELL", "/bin/zsh");
            }
            assert_eq!(resolve_shell().unwrap(), OsString::from("/bin/zsh"));
            unsafe {
                std::env::remove_var("SHELL");
            }
        }

        #[test]
        fn falls_back_when_shell_env_var_is_empty() {
            // SAFETY: this test does not run concurrently with other tests that read `SHELL`.
            unsafe {
                std::env::set_var("SHELL", "");
            }
            let shell = resolve_shell().unwrap();
            assert_ne!(shell, OsString::from(""));
            unsafe {
                std::env::remove_var("SHELL");
            }
        }
    }
}
