use owo_colors::Rgb;

pub const FG1_COLOR: (u8, u8, u8) = (86, 156, 214);
pub const FG2_COLOR: (u8, u8, u8) = (181, 206, 168);
pub const FG1: Rgb = Rgb(FG1_COLOR.0, FG1_COLOR.1, FG1_COLOR.2);
pub const FG2: Rgb = Rgb(FG2_COLOR.0, FG2_COLOR.1, FG2_COLOR.2);

/// `DISABLE_COLORS=1`/`true` turns off colorized output process-wide.
pub fn apply_disable_colors_env() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
