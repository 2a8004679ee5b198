//! Environment block of the executed program.
//!
//! Later sources override earlier ones:
//!
//! 1. the caller's base environment;
//! 2. variables generated by the pipeline (`LISTEN_*`, `HOME`, ...);
//! 3. the unit's own `KEY=VALUE` assignments;
//! 4. whatever the login session adds.

use std::ffi::CString;

use crate::Result;

/// Ordered `KEY=VALUE` set where a later `set` replaces an earlier one in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Entries in first-insertion order.
    vars: Vec<(String, String)>,
}

impl Environment {
    /// Empty environment.
    pub const fn new() -> Self {
        Self { vars: Vec::new() }
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Applies `KEY=VALUE` assignments; entries without `=` or with an
    /// empty key are ignored.
    pub fn extend_assignments<S: AsRef<str>>(&mut self, assignments: &[S]) {
        for a in assignments {
            if let Some((k, v)) = a.as_ref().split_once('=')
                && !k.is_empty()
            {
                self.set(k, v);
            }
        }
    }

    /// Applies key/value pairs.
    pub fn extend_pairs<K: AsRef<str>, V: AsRef<str>>(&mut self, pairs: &[(K, V)]) {
        for (k, v) in pairs {
            self.set(k.as_ref(), v.as_ref());
        }
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Entries, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=VALUE` C strings for `execve`.
    pub fn to_envp(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(k, v)| Ok(CString::new(format!("{k}={v}"))?))
            .collect()
    }
}

/// Inputs of the generated variables.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Generated<'a> {
    /// Pid the program will have.
    pub pid: i32,
    /// Number of passed descriptors.
    pub n_fds: usize,
    /// Their names.
    pub fd_names: &'a [String],
    /// Watchdog interval, 0 when disabled.
    pub watchdog_usec: u64,
    /// Target user name.
    pub user: Option<&'a str>,
    /// Home directory.
    pub home: Option<&'a str>,
    /// Login shell.
    pub shell: Option<&'a str>,
    /// Terminal the program talks to, if any.
    pub tty: Option<&'a str>,
    /// Invocation id.
    pub invocation_id: Option<&'a str>,
    /// `dev:ino` of the journal stream.
    pub journal_stream: Option<(u64, u64)>,
    /// Journal namespace.
    pub log_namespace: Option<&'a str>,
    /// `<TYPE>_DIRECTORY` variables.
    pub directories: &'a [(String, String)],
    /// Credential store.
    pub credentials_dir: Option<&'a str>,
}

/// `TERM` for a terminal path: the kernel console driver on virtual
/// terminals, a conservative serial default elsewhere.
pub fn default_term(tty: &str) -> &'static str {
    let name = tty.strip_prefix("/dev/").unwrap_or(tty);
    match name.strip_prefix("tty") {
        Some(rest) if rest.is_empty() || rest.bytes().all(|b| b.is_ascii_digit()) => "linux",
        _ => "vt220",
    }
}

/// Variables generated by the pipeline.
pub fn generated(g: &Generated<'_>) -> Environment {
    let mut env = Environment::new();
    if g.n_fds > 0 {
        env.set("LISTEN_PID", g.pid.to_string());
        env.set("LISTEN_FDS", g.n_fds.to_string());
        if !g.fd_names.is_empty() {
            env.set("LISTEN_FDNAMES", g.fd_names.join(":"));
        }
    }
    if g.watchdog_usec > 0 {
        env.set("WATCHDOG_PID", g.pid.to_string());
        env.set("WATCHDOG_USEC", g.watchdog_usec.to_string());
    }
    if let Some(home) = g.home {
        env.set("HOME", home);
    }
    if let Some(user) = g.user {
        env.set("LOGNAME", user);
        env.set("USER", user);
    }
    if let Some(shell) = g.shell {
        env.set("SHELL", shell);
    }
    if let Some(tty) = g.tty {
        env.set("TERM", default_term(tty));
    }
    if let Some(id) = g.invocation_id {
        env.set("INVOCATION_ID", id);
    }
    if let Some((dev, ino)) = g.journal_stream {
        env.set("JOURNAL_STREAM", format!("{dev}:{ino}"));
    }
    if let Some(ns) = g.log_namespace {
        env.set("LOG_NAMESPACE", ns);
    }
    env.extend_pairs(g.directories);
    if let Some(dir) = g.credentials_dir {
        env.set("CREDENTIALS_DIRECTORY", dir);
    }
    env.set("SYSTEMD_EXEC_PID", g.pid.to_string());
    env
}

/// Expands `$VAR`, `${VAR}` and `$$` in `argv`.
///
/// An argument that is exactly `$VAR` is split on whitespace into several
/// arguments (none if empty); `${VAR}` is substituted in place. Unset
/// variables expand to nothing.
pub fn expand_argv(argv: &[String], env: &Environment) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len());
    for arg in argv {
        if let Some(name) = arg.strip_prefix('$')
            && is_name(name)
        {
            out.extend(env.get(name).unwrap_or("").split_whitespace().map(str::to_owned));
            continue;
        }
        out.push(expand_inline(arg, env));
    }
    out
}

fn is_name(s: &str) -> bool {
    s.bytes().next().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn expand_inline(arg: &str, env: &Environment) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let tail = &rest[at + 1..];
        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{')
            && let Some(end) = body.find('}')
            && is_name(&body[..end])
        {
            out.push_str(env.get(&body[..end]).unwrap_or(""));
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let mut e = Environment::new();
        e.extend_pairs(pairs);
        e
    }

    #[test]
    fn later_sources_win_in_place() {
        let mut e = Environment::new();
        e.extend_assignments(&["PATH=/bin", "LANG=C", "broken", "=x"]);
        e.set("PATH", "/usr/bin");
        let got: Vec<_> = e.iter().collect();
        assert_eq!(got, [("PATH", "/usr/bin"), ("LANG", "C")]);
        assert_eq!(e.to_envp().unwrap()[0].to_str().unwrap(), "PATH=/usr/bin");
    }

    #[test]
    fn socket_activation_and_watchdog() {
        let names = vec!["http".to_owned(), "https".to_owned()];
        let e = generated(&Generated {
            pid: 42,
            n_fds: 2,
            fd_names: &names,
            watchdog_usec: 30_000_000,
            ..Generated::default()
        });
        assert_eq!(e.get("LISTEN_PID"), Some("42"));
        assert_eq!(e.get("LISTEN_FDS"), Some("2"));
        assert_eq!(e.get("LISTEN_FDNAMES"), Some("http:https"));
        assert_eq!(e.get("WATCHDOG_USEC"), Some("30000000"));
        assert_eq!(e.get("SYSTEMD_EXEC_PID"), Some("42"));
    }

    #[test]
    fn no_fds_no_listen_vars() {
        let e = generated(&Generated {
            pid: 1,
            user: Some("nobody"),
            journal_stream: Some((8, 1234)),
            credentials_dir: Some("/run/credentials/a.service"),
            ..Generated::default()
        });
        assert!(e.get("LISTEN_FDS").is_none());
        assert_eq!(e.get("USER"), Some("nobody"));
        assert_eq!(e.get("LOGNAME"), Some("nobody"));
        assert_eq!(e.get("JOURNAL_STREAM"), Some("8:1234"));
        assert_eq!(e.get("CREDENTIALS_DIRECTORY"), Some("/run/credentials/a.service"));
    }

    #[test]
    fn term_follows_terminal_kind() {
        assert_eq!(default_term("/dev/tty1"), "linux");
        assert_eq!(default_term("/dev/ttyS0"), "vt220");
        assert_eq!(default_term("/dev/console"), "vt220");
    }

    #[test]
    fn argv_expansion() {
        let e = env(&[("OPTS", "-v  --fast"), ("DIR", "/srv"), ("EMPTY", "")]);
        let argv: Vec<String> = ["/bin/app", "$OPTS", "--root=${DIR}/x", "$EMPTY", "cost$$", "${MISSING}end", "$1"]
            .map(String::from)
            .to_vec();
        assert_eq!(
            expand_argv(&argv, &e),
            ["/bin/app", "-v", "--fast", "--root=/srv/x", "cost$", "end", "$1"]
        );
    }
}
