//! Building the code-modification tool invocation and cleaning its output.

use std::sync::LazyLock;

use regex::Regex;

// CSI, OSC and two-byte escapes, then any remaining C0 control except \t and \n.
static CONTROL_SEQUENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]|[\x00-\x08\x0b-\x1f\x7f]",
    )
    .unwrap()
});

/// Remove terminal control sequences (colours, cursor movement, titles,
/// carriage returns) so only printable text is relayed and stored.
pub fn strip_control_sequences(text: &str) -> String {
    CONTROL_SEQUENCE_REGEX.replace_all(text, "").into_owned()
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wrap a user's literal request in the instructions given to the tool.
pub fn wrap_edit_prompt(request: &str, site_name: &str) -> String {
    format!(
        "You are editing the website \"{site}\" in the current directory. \
         A development server is already running with live reload, so do not \
         start, stop or restart it, and do not install new packages unless the \
         request cannot be done without them. Make the smallest change that \
         fulfils the request, keep the existing style, and finish with a short \
         summary of what you changed.\n\nRequest:\n{request}",
        site = site_name,
        request = request.trim(),
    )
}

/// Full shell command line for one edit.
pub fn edit_command(tool_command: &str, request: &str, site_name: &str) -> String {
    format!(
        "{} {}",
        tool_command,
        shell_quote(&wrap_edit_prompt(request, site_name))
    )
}
