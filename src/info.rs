//! The "ready" screen shown when there is nothing to play.

use std::fs;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::Command;

use chrono::Local;
use fontdue::{Font, FontSettings};
use image::{ImageFormat, Rgb, RgbImage};
use sysinfo::System;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::constants::{INFO_HEIGHT, INFO_WIDTH};
use crate::error::Result;

const TITLE: &str = "Slideshow ready";
const TITLE_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf";
const TEXT_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";
const FILE_NAME: &str = "info_screen.png";

const MARGIN: u32 = 60;
const BACKGROUND: Rgb<u8> = Rgb([0x0b, 0x1d, 0x36]);
const TITLE_COLOR: Rgb<u8> = Rgb([0xf7, 0xfa, 0xff]);
const TEXT_COLOR: Rgb<u8> = Rgb([0xe2, 0xeb, 0xff]);

const TITLE_SIZE: (f32, f32) = (56.0, 32.0); // start, floor
const TEXT_SIZE: (f32, f32) = (36.0, 20.0);
const SIZE_STEP: f32 = 2.0;

const BULLET: &str = "  - ";
const BULLET_INDENT: &str = "    ";

struct Fonts {
    title: Font,
    text: Font,
}

fn load_font(path: &str) -> Option<Font> {
    let bytes = fs::read(path)
        .map_err(|e| debug!("Font {path} unavailable: {e}"))
        .ok()?;
    Font::from_bytes(bytes, FontSettings::default())
        .map_err(|e| warn!("Font {path} could not be parsed: {e}"))
        .ok()
}

fn text_width(font: &Font, size: f32, text: &str) -> f32 {
    text.chars().map(|ch| font.metrics(ch, size).advance_width).sum()
}

/// Ascent and full height of one line at `size`.
fn line_box(font: &Font, size: f32) -> (f32, f32) {
    match font.horizontal_line_metrics(size) {
        Some(metrics) => (metrics.ascent, metrics.ascent - metrics.descent),
        None => (size * 0.8, size),
    }
}

fn wrap_words(font: &Font, size: f32, max_width: f32, text: &str, prefix: &str, indent: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut lead = prefix;
    for word in text.split_whitespace() {
        if current.is_empty()
            || text_width(font, size, &format!("{lead}{} {word}", current.join(" "))) <= max_width
        {
            current.push(word);
            continue;
        }
        lines.push(format!("{lead}{}", current.join(" ")));
        lead = indent;
        current = vec![word];
    }
    if current.is_empty() {
        lines.push(prefix.trim_end().to_string());
    } else {
        lines.push(format!("{lead}{}", current.join(" ")));
    }
    lines
}

/// Word-wraps every line to `max_width`; bullet items wrap under their text.
fn wrap_lines(font: &Font, size: f32, max_width: f32, lines: &[String]) -> Vec<String> {
    let mut wrapped = Vec::new();
    for line in lines {
        if line.is_empty() {
            wrapped.push(String::new());
        } else if let Some(rest) = line.strip_prefix(BULLET) {
            wrapped.extend(wrap_words(font, size, max_width, rest, BULLET, BULLET_INDENT));
        } else {
            wrapped.extend(wrap_words(font, size, max_width, line, "", ""));
        }
    }
    wrapped
}

struct Spacing {
    title_height: f32,
    text_height: f32,
    line_gap: f32,
    after_title: f32,
}

impl Spacing {
    fn new(fonts: &Fonts, title_size: f32, text_size: f32) -> Self {
        let (_, title_height) = line_box(&fonts.title, title_size);
        let (_, text_height) = line_box(&fonts.text, text_size);
        let line_gap = (text_height * 0.35).floor().max(6.0);
        Self {
            title_height,
            text_height,
            line_gap,
            after_title: (text_height * 0.8).floor().max(line_gap),
        }
    }

    fn blank(&self) -> f32 {
        (self.text_height / 2.0).floor().max(self.line_gap)
    }

    fn total(&self, lines: &[String]) -> f32 {
        let mut height = 2.0 * MARGIN as f32 + self.title_height + self.after_title;
        for line in lines {
            height += if line.is_empty() { self.blank() } else { self.text_height };
            height += self.line_gap;
        }
        if !lines.is_empty() {
            height -= self.line_gap;
        }
        height
    }
}

fn draw_text(canvas: &mut RgbImage, font: &Font, size: f32, x: f32, top: f32, text: &str, color: Rgb<u8>) {
    let (ascent, _) = line_box(font, size);
    let baseline = top + ascent;
    let mut pen = x;
    for ch in text.chars() {
        let (metrics, coverage) = font.rasterize(ch, size);
        let left = pen.round() as i64 + metrics.xmin as i64;
        let glyph_top = baseline.round() as i64 - metrics.height as i64 - metrics.ymin as i64;
        for row in 0..metrics.height {
            for col in 0..metrics.width {
                let alpha = coverage[row * metrics.width + col] as u32;
                let (px, py) = (left + col as i64, glyph_top + row as i64);
                if alpha == 0 || px < 0 || py < 0 || px >= canvas.width() as i64 || py >= canvas.height() as i64 {
                    continue;
                }
                let pixel = canvas.get_pixel_mut(px as u32, py as u32);
                for channel in 0..3 {
                    let under = pixel.0[channel] as u32;
                    pixel.0[channel] = ((under * (255 - alpha) + color.0[channel] as u32 * alpha) / 255) as u8;
                }
            }
        }
        pen += metrics.advance_width;
    }
}

/// Renders the info screen into a fixed file under its output directory.
pub struct InfoScreen {
    output_dir: PathBuf,
    fonts: Option<Fonts>,
}

impl InfoScreen {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let fonts = match (load_font(TITLE_FONT), load_font(TEXT_FONT)) {
            (Some(title), Some(text)) => Some(Fonts { title, text }),
            _ => {
                warn!("DejaVu fonts not found, info screen will be blank");
                None
            }
        };
        Self { output_dir: output_dir.into(), fonts }
    }

    #[cfg(test)]
    fn without_fonts(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into(), fonts: None }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(FILE_NAME)
    }

    /// The text content, title first.
    pub fn compose(hostname: &str, addresses: &[String], manual: bool, details: &[String]) -> Vec<String> {
        let mut lines = vec![TITLE.to_string(), format!("Hostname: {hostname}"), "IP addresses:".to_string()];
        if addresses.is_empty() {
            lines.push(format!("{BULLET}no address available"));
        } else {
            lines.extend(addresses.iter().map(|ip| format!("{BULLET}{ip}")));
        }
        lines.push(String::new());
        lines.push(format!("Updated: {}", Local::now().format("%Y-%m-%d %H:%M:%S")));
        if manual {
            lines.push("(info screen enabled manually)".to_string());
        }
        if !details.is_empty() {
            lines.push(String::new());
            lines.extend(details.iter().cloned());
        }
        lines
    }

    pub fn render(&self, hostname: &str, addresses: &[String], manual: bool, details: &[String]) -> Result<PathBuf> {
        let lines = Self::compose(hostname, addresses, manual, details);
        let mut canvas = RgbImage::from_pixel(INFO_WIDTH, INFO_HEIGHT, BACKGROUND);
        if let Some(fonts) = &self.fonts {
            draw_layout(&mut canvas, fonts, &lines);
        }

        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_path();
        let staging = self.output_dir.join(format!(".{FILE_NAME}"));
        canvas.save_with_format(&staging, ImageFormat::Png)?;
        fs::rename(&staging, &path)?;
        Ok(path)
    }
}

fn draw_layout(canvas: &mut RgbImage, fonts: &Fonts, lines: &[String]) {
    let Some((title, body)) = lines.split_first() else {
        return;
    };
    let max_width = (canvas.width() - 2 * MARGIN) as f32;
    let limit = canvas.height() as f32;

    let (mut title_size, mut text_size) = (TITLE_SIZE.0, TEXT_SIZE.0);
    let mut wrapped = wrap_lines(&fonts.text, text_size, max_width, body);
    let mut spacing = Spacing::new(fonts, title_size, text_size);
    while spacing.total(&wrapped) > limit && text_size > TEXT_SIZE.1 {
        text_size -= SIZE_STEP;
        wrapped = wrap_lines(&fonts.text, text_size, max_width, body);
        spacing = Spacing::new(fonts, title_size, text_size);
    }
    while spacing.total(&wrapped) > limit && title_size > TITLE_SIZE.1 {
        title_size -= SIZE_STEP;
        spacing = Spacing::new(fonts, title_size, text_size);
    }

    let x = MARGIN as f32;
    let mut y = MARGIN as f32;
    draw_text(canvas, &fonts.title, title_size, x, y, title, TITLE_COLOR);
    y += spacing.title_height + spacing.after_title;
    for line in &wrapped {
        if line.is_empty() {
            y += spacing.blank();
            continue;
        }
        draw_text(canvas, &fonts.text, text_size, x, y, line, TEXT_COLOR);
        y += spacing.text_height + spacing.line_gap;
    }
}

pub fn hostname() -> String {
    System::host_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// IPv4 addresses from `hostname -I`, falling back to resolving the hostname.
pub fn ip_addresses() -> Vec<String> {
    match Command::new("hostname").arg("-I").output() {
        Ok(output) if output.status.success() => {
            let addresses: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if !addresses.is_empty() {
                return addresses;
            }
        }
        Ok(output) => debug!("hostname -I exited with {}", output.status),
        Err(e) => debug!("hostname -I failed: {e}"),
    }

    let mut addresses: Vec<String> = (hostname().as_str(), 0)
        .to_socket_addrs()
        .map(|resolved| {
            resolved
                .filter_map(|addr| match addr.ip() {
                    IpAddr::V4(ip) => Some(ip.to_string()),
                    IpAddr::V6(_) => None,
                })
                .collect()
        })
        .unwrap_or_default();
    addresses.sort();
    addresses.dedup();
    addresses
}

/// Configuration facts listed below the addresses.
pub fn details(config: &AppConfig) -> Vec<String> {
    let playback = &config.playback;
    let mut details = Vec::new();
    for source in &config.sources {
        details.push(format!("Media directory: {} ({})", source.path.display(), source.name));
    }
    details.push(format!("Display resolution: {}", playback.display_resolution));
    details.push(match playback.split_ratio() {
        Some(ratio) => format!("Splitscreen: on ({ratio}% left)"),
        None => "Splitscreen: off".to_string(),
    });
    details
}
