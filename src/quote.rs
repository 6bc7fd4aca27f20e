//! Shell-safe command construction for remote execution.
//!
//! Every token handed to the remote shell goes through [`quote`], including
//! commands and arguments without metacharacters.

use std::borrow::Cow;
use std::path::Path;

use shell_escape::unix::escape;

use crate::pipeline::File;

/// Quote a single token for a POSIX shell
pub fn quote(token: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(token))
}

/// Directory that has to exist before `file` can be written
fn target_dir(file: &File) -> &str {
    if file.is_dir {
        return &file.path;
    }
    Path::new(&file.path)
        .parent()
        .and_then(Path::to_str)
        .filter(|dir| !dir.is_empty())
        .unwrap_or(".")
}

/// Build one `mkdir -p` clause per entry, joined with `&&`
///
/// Regular files contribute their containing directory; directory entries
/// contribute themselves. Empty input yields an empty string.
pub fn make_dirs_command(files: &[File]) -> String {
    files
        .iter()
        .map(|file| format!("mkdir -p {}", quote(target_dir(file))))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Build the full remote command line for one step
///
/// `mkdir -p <wd> && cd <wd> && env NAME=VALUE... <command> <args...>`
pub fn step_command<I, K, V>(command: &str, args: &[String], env: I, working_dir: &str) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let working_dir = quote(working_dir);

    let mut tokens = vec!["env".to_string()];
    for (name, value) in env {
        let pair = format!("{}={}", name.as_ref(), value.as_ref());
        tokens.push(quote(&pair).into_owned());
    }
    tokens.push(quote(command).into_owned());
    tokens.extend(args.iter().map(|arg| quote(arg).into_owned()));

    format!(
        "mkdir -p {working_dir} && cd {working_dir} && {}",
        tokens.join(" ")
    )
}
