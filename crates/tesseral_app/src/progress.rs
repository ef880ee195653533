use indicatif::ProgressStyle;

/// Progress bar for the main step loop:
/// `<prefix> #### <pos>/<len> cycles, <message>`
pub fn cycle_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold.dim} {bar:.cyan/blue} {human_pos}/{human_len} cycles, {wide_msg}",
    )
    .unwrap()
}

/// Spinner for open-ended phases:
/// `<prefix> . <message>`
pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {wide_msg}")
        .unwrap()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
}

/// Progress bar for bulk file transfers:
/// `<prefix> #### <bytes>/<total>, <percent>%`
pub fn byte_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold.dim} {bar:.cyan/blue} {binary_bytes}/{binary_total_bytes}, {percent}%",
    )
    .unwrap()
}
