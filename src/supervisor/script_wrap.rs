//! Submission-script wrapping: splits a user's `sbatch` script into its
//! header (shebang, `#SBATCH` directives, blank/comment lines) and body,
//! then rebuilds a script that runs the body through the wrapper binary via
//! a shell here-document. Mirrors the Python reference implementation's
//! `submit.py::wrap_script`.

const HEREDOC_MARKER: &str = "__SHEPHERD_SCRIPT_END__";

/// Split `script` into `(header, body)`. The header is the leading run of
/// lines that are the shebang, `#SBATCH` directives, blank lines, or other
/// comments; `#SHEPHERD` directive lines are recognized as header lines but
/// dropped from the output entirely. The body is everything from the first
/// non-header line onward.
#[must_use]
pub fn split_header_body(script: &str) -> (String, String) {
    let lines: Vec<&str> = script.lines().collect();
    let mut header_lines: Vec<&str> = Vec::new();
    let mut body_start = lines.len();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let is_shebang = i == 0 && trimmed.starts_with("#!");
        let is_shepherd_directive = trimmed.starts_with("#SHEPHERD");
        let is_header_comment = trimmed.starts_with("#SBATCH") || trimmed.starts_with('#') || trimmed.is_empty();

        if is_shepherd_directive {
            continue;
        }
        if is_shebang || is_header_comment {
            header_lines.push(line);
            continue;
        }
        body_start = i;
        break;
    }

    let body = lines[body_start..].join("\n");
    (header_lines.join("\n"), body)
}

/// Rebuild a submission script that preserves the original header, then
/// invokes `wrapper_invocation` (the full wrapper command line, including
/// `--run-id`/`--run-mode`/`--state-dir`) against the body through a quoted
/// here-document so the body's own shell metacharacters are never
/// re-interpreted by the outer script.
#[must_use]
pub fn wrap_script(header: &str, body: &str, wrapper_invocation: &str) -> String {
    let mut out = String::new();
    if !header.is_empty() {
        out.push_str(header);
        out.push('\n');
    }
    out.push_str(wrapper_invocation);
    out.push_str(" -- bash <<'");
    out.push_str(HEREDOC_MARKER);
    out.push_str("'\n");
    out.push_str(body);
    out.push('\n');
    out.push_str(HEREDOC_MARKER);
    out.push('\n');
    out
}

/// The wrapper invocation command line itself, shared between the normal
/// wrapping path and the fallback path used when the user script cannot be
/// read from disk.
#[must_use]
pub fn wrapper_invocation(wrapper_bin: &str, state_dir: &str, run_id: &str, run_mode: &str) -> String {
    format!(
        "{wrapper_bin} --run-id {run_id} --run-mode {run_mode} --state-dir {state_dir}",
        wrapper_bin = shlex::try_quote(wrapper_bin).unwrap_or_default(),
        state_dir = shlex::try_quote(state_dir).unwrap_or_default(),
        run_id = shlex::try_quote(run_id).unwrap_or_default(),
        run_mode = shlex::try_quote(run_mode).unwrap_or_default(),
    )
}

/// Fallback submission body when the user's script cannot be read from
/// disk: invoke the wrapper directly on the script path rather than on an
/// inlined body.
#[must_use]
pub fn fallback_script(wrapper_invocation: &str, script_path: &str) -> String {
    format!("{wrapper_invocation} -- bash {}\n", shlex::try_quote(script_path).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_shebang_and_sbatch_header_from_body() {
        let script = "#!/bin/bash\n#SBATCH --time=01:00:00\n#SBATCH --mem=16G\n\npython train.py\n";
        let (header, body) = split_header_body(script);
        assert_eq!(header, "#!/bin/bash\n#SBATCH --time=01:00:00\n#SBATCH --mem=16G\n");
        assert_eq!(body, "python train.py");
    }

    #[test]
    fn drops_shepherd_directives_from_header() {
        let script = "#!/bin/bash\n#SHEPHERD --max-retries=5\n#SBATCH --mem=16G\npython train.py\n";
        let (header, body) = split_header_body(script);
        assert!(!header.contains("SHEPHERD"));
        assert!(header.contains("#SBATCH --mem=16G"));
        assert_eq!(body, "python train.py");
    }

    #[test]
    fn body_with_no_header_lines() {
        let script = "python train.py\necho done\n";
        let (header, body) = split_header_body(script);
        assert_eq!(header, "");
        assert_eq!(body, "python train.py\necho done");
    }

    #[test]
    fn all_header_no_body() {
        let script = "#!/bin/bash\n#SBATCH --mem=16G\n";
        let (header, body) = split_header_body(script);
        assert_eq!(header, "#!/bin/bash\n#SBATCH --mem=16G");
        assert_eq!(body, "");
    }

    #[test]
    fn wrap_script_embeds_body_in_heredoc() {
        let wrapped = wrap_script("#!/bin/bash\n#SBATCH --mem=16G", "python train.py", "shepherd-wrapper --run-id r1 --run-mode run_once");
        assert!(wrapped.starts_with("#!/bin/bash\n#SBATCH --mem=16G\n"));
        assert!(wrapped.contains("<<'__SHEPHERD_SCRIPT_END__'"));
        assert!(wrapped.contains("python train.py"));
        assert!(wrapped.trim_end().ends_with("__SHEPHERD_SCRIPT_END__"));
    }

    #[test]
    fn fallback_script_invokes_wrapper_on_path_directly() {
        let out = fallback_script("shepherd-wrapper --run-id r1", "/home/user/job.sh");
        assert_eq!(out, "shepherd-wrapper --run-id r1 -- bash /home/user/job.sh\n");
    }
}
