//! POSIX shell command construction.
//!
//! The sandbox surface is a shell pipe, so every remote operation in this
//! crate is a shell program composed here — never by raw string
//! concatenation. [`quote`] is the primitive; the `safe` module holds the
//! vetted command templates; [`redact_secrets`] scrubs scripts before they
//! reach a log line.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

/// Raw flags accepted by [`CommandBuilder::flag`]: `-x`, `--long-flag`, …
static FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^-{1,2}[A-Za-z][A-Za-z0-9_-]*$").expect("static regex")
});

/// POSIX-portable environment variable names.
static ENV_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex")
});

/// `export KEY=value` lines whose KEY smells like a secret.
static SECRET_EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(
        r"(?i)(export\s+[A-Za-z_][A-Za-z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD|CREDENTIAL)[A-Za-z0-9_]*=)('[^']*'|\S+)",
    )
    .expect("static regex")
});

/// Inline API-key material (`sk-…`, bearer values) outside export lines.
static SECRET_INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\b(sk-[A-Za-z0-9_-]{8,}|ghp_[A-Za-z0-9]{20,}|Bearer\s+[A-Za-z0-9._-]{8,})")
        .expect("static regex")
});

/// Quote `s` for POSIX `sh`: wrap in single quotes, rewriting embedded `'`
/// as `'\''`. The result re-expands byte-for-byte under `sh -c`.
#[must_use]
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote each argument.
pub fn quote_all<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().map(|a| quote(a.as_ref())).collect()
}

/// Quote and join arguments into a single command string.
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    quote_all(args).join(" ")
}

/// Emit `export KEY='value'`.
///
/// # Errors
///
/// Returns an error if `key` is not a valid environment variable name.
pub fn export_env(key: &str, value: &str) -> Result<String> {
    validate_env_key(key)?;
    Ok(format!("export {key}={}", quote(value)))
}

/// Emit an inline assignment prefix: `KEY='value' <cmd>`.
///
/// # Errors
///
/// Returns an error if `key` is not a valid environment variable name.
pub fn env_assignment(key: &str, value: &str, cmd: &str) -> Result<String> {
    validate_env_key(key)?;
    Ok(format!("{key}={} {cmd}", quote(value)))
}

fn validate_env_key(key: &str) -> Result<()> {
    if !ENV_KEY_RE.is_match(key) {
        bail!("invalid environment variable name: {key:?}");
    }
    Ok(())
}

/// Reject paths that could break out of a quoted shell context: null bytes
/// and the metacharacters `; | & $ ` ( ) { } < >` plus newlines.
///
/// # Errors
///
/// Returns an error naming the offending character.
pub fn validate_path(path: &str) -> Result<()> {
    for ch in path.chars() {
        if ch == '\0' {
            bail!("path contains a null byte");
        }
        if matches!(
            ch,
            ';' | '|' | '&' | '$' | '`' | '(' | ')' | '{' | '}' | '<' | '>' | '\n' | '\r'
        ) {
            bail!("path contains shell metacharacter {ch:?}");
        }
    }
    Ok(())
}

/// Incrementally builds a single shell command: a program, validated raw
/// flags, and quoted positional arguments.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    parts: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            parts: vec![quote(program)],
        }
    }

    /// Append a quoted positional argument.
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        self.parts.push(quote(arg));
        self
    }

    /// Append a raw flag. Only `-x` / `--flag-name` shapes are accepted so a
    /// flag can never smuggle shell syntax.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag does not match the accepted shape.
    pub fn flag(mut self, flag: &str) -> Result<Self> {
        if !FLAG_RE.is_match(flag) {
            bail!("invalid flag: {flag:?}");
        }
        self.parts.push(flag.to_string());
        Ok(self)
    }

    /// Render the final command string.
    #[must_use]
    pub fn build(self) -> String {
        self.parts.join(" ")
    }
}

/// Vetted remote command templates. Everything the lifecycle controller,
/// installer, home layout, and sync run remotely goes through one of these
/// or through [`CommandBuilder`].
pub mod safe {
    use super::quote;

    #[must_use]
    pub fn mkdir_p(path: &str) -> String {
        format!("mkdir -p {}", quote(path))
    }

    #[must_use]
    pub fn rm_rf(path: &str) -> String {
        format!("rm -rf {}", quote(path))
    }

    #[must_use]
    pub fn rm_f(path: &str) -> String {
        format!("rm -f {}", quote(path))
    }

    /// `ln -sfn target link` — replace `link` atomically.
    #[must_use]
    pub fn ln_sfn(target: &str, link: &str) -> String {
        format!("ln -sfn {} {}", quote(target), quote(link))
    }

    #[must_use]
    pub fn touch(path: &str) -> String {
        format!("touch {}", quote(path))
    }

    /// `chmod <mode> path` for the fixed modes the home layout uses.
    #[must_use]
    pub fn chmod(mode: &str, path: &str) -> String {
        format!("chmod {mode} {}", quote(path))
    }

    #[must_use]
    pub fn cat(path: &str) -> String {
        format!("cat {}", quote(path))
    }

    /// `test -<flag> path`, e.g. `test -f`, `test -d`, `test -L`.
    #[must_use]
    pub fn test_flag(flag: char, path: &str) -> String {
        format!("test -{flag} {}", quote(path))
    }

    #[must_use]
    pub fn tar_czf(archive: &str, dir: &str) -> String {
        format!("tar -czf {} -C {} .", quote(archive), quote(dir))
    }

    #[must_use]
    pub fn tar_xzf(archive: &str, dest: &str) -> String {
        format!("tar -xzf {} -C {}", quote(archive), quote(dest))
    }

    /// File mtime in epoch seconds; GNU stat first, BSD fallback.
    #[must_use]
    pub fn stat_mtime(path: &str) -> String {
        let p = quote(path);
        format!("stat -c %Y {p} 2>/dev/null || stat -f %m {p}")
    }
}

/// Scrub secret material from a shell script before logging it.
#[must_use]
pub fn redact_secrets(script: &str) -> String {
    let pass1 = SECRET_EXPORT_RE.replace_all(script, "$1'[REDACTED]'");
    SECRET_INLINE_RE.replace_all(&pass1, "[REDACTED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_string() {
        assert_eq!(quote("hello"), "'hello'");
    }

    #[test]
    fn test_quote_embedded_single_quote() {
        assert_eq!(quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn test_quote_empty_string() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_quote_shell_metacharacters_are_inert() {
        // The characters stay inside single quotes; nothing is rewritten.
        assert_eq!(quote("a;b|$(x)"), "'a;b|$(x)'");
    }

    #[test]
    fn test_join_quotes_every_argument() {
        assert_eq!(join(["echo", "a b", "c'd"]), "'echo' 'a b' 'c'\\''d'");
    }

    #[test]
    fn test_command_builder_args_quoted_flags_raw() {
        let cmd = CommandBuilder::new("tar")
            .flag("-czf")
            .expect("valid flag")
            .arg("/tmp/out tgz")
            .build();
        assert_eq!(cmd, "'tar' -czf '/tmp/out tgz'");
    }

    #[test]
    fn test_command_builder_rejects_flag_injection() {
        assert!(CommandBuilder::new("ls").flag("--flag; rm -rf /").is_err());
        assert!(CommandBuilder::new("ls").flag("notaflag").is_err());
        assert!(CommandBuilder::new("ls").flag("---three").is_err());
        assert!(CommandBuilder::new("ls").flag("-").is_err());
    }

    #[test]
    fn test_export_env_quotes_value() {
        assert_eq!(
            export_env("AMUX_TEST", "a'b").expect("valid key"),
            "export AMUX_TEST='a'\\''b'"
        );
    }

    #[test]
    fn test_export_env_rejects_bad_keys() {
        assert!(export_env("1BAD", "x").is_err());
        assert!(export_env("BAD-KEY", "x").is_err());
        assert!(export_env("BAD KEY", "x").is_err());
        assert!(export_env("", "x").is_err());
    }

    #[test]
    fn test_env_assignment_prefixes_command() {
        assert_eq!(
            env_assignment("TERM", "xterm-256color", "infocmp").expect("valid key"),
            "TERM='xterm-256color' infocmp"
        );
    }

    #[test]
    fn test_validate_path_accepts_ordinary_paths() {
        assert!(validate_path("/amux/home/.config").is_ok());
        assert!(validate_path("relative/path with spaces").is_ok());
    }

    #[test]
    fn test_validate_path_rejects_metacharacters() {
        for bad in [
            "a;b", "a|b", "a&b", "a$b", "a`b", "a(b", "a)b", "a{b", "a}b", "a<b", "a>b", "a\nb",
            "a\rb", "a\0b",
        ] {
            assert!(validate_path(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn test_safe_templates_quote_paths() {
        assert_eq!(safe::mkdir_p("/amux/.installed"), "mkdir -p '/amux/.installed'");
        assert_eq!(safe::rm_rf("/tmp/x y"), "rm -rf '/tmp/x y'");
        assert_eq!(safe::rm_f("/tmp/f"), "rm -f '/tmp/f'");
        assert_eq!(
            safe::ln_sfn("/amux/home/.npm", "/root/.npm"),
            "ln -sfn '/amux/home/.npm' '/root/.npm'"
        );
        assert_eq!(safe::touch("/amux/.installed/claude"), "touch '/amux/.installed/claude'");
        assert_eq!(safe::chmod("700", "/amux/home"), "chmod 700 '/amux/home'");
        assert_eq!(safe::test_flag('f', "/etc/passwd"), "test -f '/etc/passwd'");
        assert_eq!(
            safe::tar_czf("/tmp/amux-download.tgz", "/repo"),
            "tar -czf '/tmp/amux-download.tgz' -C '/repo' ."
        );
        assert_eq!(
            safe::tar_xzf("/tmp/amux-upload.tgz", "/repo"),
            "tar -xzf '/tmp/amux-upload.tgz' -C '/repo'"
        );
    }

    #[test]
    fn test_stat_mtime_has_bsd_fallback() {
        let cmd = safe::stat_mtime("/amux/.installed/codex");
        assert!(cmd.contains("stat -c %Y"));
        assert!(cmd.contains("stat -f %m"));
        assert!(cmd.contains("||"));
    }

    #[test]
    fn test_redact_secrets_masks_export_values() {
        let script = "export ANTHROPIC_API_KEY='sk-ant-secret123456'\nexport PATH='/bin'";
        let redacted = redact_secrets(script);
        assert!(!redacted.contains("secret123456"));
        assert!(redacted.contains("export ANTHROPIC_API_KEY='[REDACTED]'"));
        // Non-secret exports are untouched.
        assert!(redacted.contains("export PATH='/bin'"));
    }

    #[test]
    fn test_redact_secrets_masks_token_password_credential_keys() {
        for key in [
            "GITHUB_TOKEN",
            "DB_PASSWORD",
            "AWS_SECRET",
            "SERVICE_CREDENTIAL",
        ] {
            let script = format!("export {key}=supersensitive");
            let redacted = redact_secrets(&script);
            assert!(!redacted.contains("supersensitive"), "{key} leaked");
        }
    }

    #[test]
    fn test_redact_secrets_masks_inline_api_keys() {
        let script = "curl -H 'Authorization: Bearer abcd1234efgh' https://api.example.com";
        assert!(!redact_secrets(script).contains("abcd1234efgh"));

        let script2 = "amux --key sk-ant-REDACTED";
        assert!(!redact_secrets(script2).contains("verylongsecret"));
    }
}
