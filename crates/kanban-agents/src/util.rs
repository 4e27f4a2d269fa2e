use crate::types::CommandSpec;

/// Shell-quote a value using POSIX single-quote escaping.
pub(crate) fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Renders a copy-pasteable preview of a command, env overrides included.
pub fn render_command_preview(spec: &CommandSpec) -> String {
    let mut rendered = String::new();
    if let Some(cwd) = &spec.cwd {
        rendered.push_str("cd ");
        rendered.push_str(&shell_quote(&cwd.display().to_string()));
        rendered.push_str(" && ");
    }

    for (key, value) in &spec.env {
        if key.trim().is_empty() {
            continue;
        }
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(&shell_quote(value));
        rendered.push(' ');
    }

    rendered.push_str(&shell_quote(&spec.program));
    for arg in &spec.args {
        rendered.push(' ');
        rendered.push_str(&shell_quote(arg));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::{render_command_preview, shell_quote};
    use crate::types::CommandSpec;
    use std::path::PathBuf;

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("O'Reilly"), "'O'\"'\"'Reilly'");
    }

    #[test]
    fn preview_renders_cd_env_and_command() {
        let mut spec = CommandSpec::new("codex").arg("exec").arg("it's");
        spec.cwd = Some(PathBuf::from("/tmp/wt path"));
        spec.env = vec![
            ("FOO".to_string(), "BAR".to_string()),
            ("".to_string(), "SKIP".to_string()),
        ];

        let rendered = render_command_preview(&spec);
        assert!(rendered.starts_with("cd '/tmp/wt path' && "));
        assert!(rendered.contains("FOO='BAR' "));
        assert!(!rendered.contains("SKIP"));
        assert!(rendered.ends_with("'codex' 'exec' 'it'\"'\"'s'"));
    }

    #[test]
    fn preview_without_cwd_starts_with_program() {
        let rendered = render_command_preview(&CommandSpec::new("npx").arg("-y"));
        assert_eq!(rendered, "'npx' '-y'");
    }
}
