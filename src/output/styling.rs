use console::style;

/// Warnings and non-final statuses on the `inspect` output.
pub fn bright_yellow(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().yellow()
}

pub fn bright_green(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().green()
}

pub fn bright_red(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().red()
}

/// Secondary detail such as the version and start time.
pub fn dim(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).dim()
}

pub fn magenta_bold(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).magenta().bold()
}

/// Colors a status label the way the table cells do.
pub fn status_style(label: &str) -> console::StyledObject<String> {
    match label {
        "SUCCESS" => bright_green(label),
        "FAILURE" => bright_red(label),
        "UNSTABLE" | "ABORTED" => bright_yellow(label),
        _ => dim(label),
    }
}
