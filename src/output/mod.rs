mod styling;
mod tables;

pub use styling::{bright_yellow, dim, magenta_bold};
pub use tables::build_table;

use crate::records::{millis_to_seconds, BuildRecord};

/// Prints the `FlowMetrix` banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("📈 FlowMetrix"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Pipeline stage metrics exporter")
    );
}

/// Prints one build and its flattened stages to stdout.
pub fn print_build(build: &BuildRecord) {
    println!(
        "{} #{}  {}  {:.1}s",
        magenta_bold(&build.job_name),
        build.build_number,
        styling::status_style(build.overall_status.as_label()),
        millis_to_seconds(build.overall_duration_ms)
    );

    if let Some(started_at) = build.started_at {
        println!("{}", dim(format!("started {}", started_at.to_rfc3339())));
    }

    if build.stages.is_empty() {
        println!("{}", bright_yellow("No stages reported for this build"));
        return;
    }

    println!("{}", build_table(build));
}
