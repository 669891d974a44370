//! Rewriting of `RUN` instructions in Dockerfiles.

/// Add `prefix` after `RUN ` and `suffix` after the last line of every `RUN` instruction.
/// Continuation lines (ending in `\`) and comments inside them are kept as they are.
pub fn update_run_commands(content: &str, prefix: &str, suffix: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut in_run = false;
    for line in content.lines() {
        if !in_run && !line.starts_with("RUN ") {
            lines.push(line.to_string());
            continue;
        }
        let mut line = match line.strip_prefix("RUN ") {
            Some(rest) if !in_run => format!("RUN {}{}", prefix, rest),
            _ => line.to_string(),
        };
        if line.ends_with('\\') {
            in_run = true;
        } else if !line.trim_start().starts_with('#') {
            line.push_str(suffix);
            in_run = false;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Make every build secret available to each `RUN` step through a BuildKit secret mount.
pub fn prepend_secret_mounts<S: AsRef<str>>(content: &str, secrets: &[S]) -> String {
    if secrets.is_empty() {
        return content.to_string();
    }
    let mounts: Vec<String> = secrets
        .iter()
        .map(|id| format!("--mount=type=secret,id={}", id.as_ref()))
        .collect();
    update_run_commands(content, &format!("{} ", mounts.join(" ")), "")
}
