//! CSS-style color parsing

use crate::style::function::PropertyType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Straight (non-premultiplied) RGBA color with channels in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, 1.0)
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }

    /// Channel values as bytes, alpha multiplied by `opacity`
    pub fn to_rgba8(&self, opacity: f32) -> [u8; 4] {
        let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [
            byte(self.r),
            byte(self.g),
            byte(self.b),
            byte(self.a * opacity),
        ]
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(hex) = s.strip_prefix('#') {
            return parse_hex(hex).ok_or_else(|| format!("invalid hex color #{}", hex));
        }
        if let Some(args) = s.strip_prefix("rgba(").and_then(|r| r.strip_suffix(')')) {
            return parse_rgb_args(args, true).ok_or_else(|| format!("invalid color {}", s));
        }
        if let Some(args) = s.strip_prefix("rgb(").and_then(|r| r.strip_suffix(')')) {
            return parse_rgb_args(args, false).ok_or_else(|| format!("invalid color {}", s));
        }
        named(&s).ok_or_else(|| format!("unknown color {}", s))
    }
}

fn parse_hex(hex: &str) -> Option<Color> {
    let digit = |i: usize| u8::from_str_radix(hex.get(i..i + 1)?, 16).ok();
    let pair = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        3 => Some(Color::rgb(digit(0)? * 17, digit(1)? * 17, digit(2)? * 17)),
        6 => Some(Color::rgb(pair(0)?, pair(2)?, pair(4)?)),
        8 => Some(Color::rgb(pair(0)?, pair(2)?, pair(4)?).with_alpha(pair(6)? as f32 / 255.0)),
        _ => None,
    }
}

fn parse_rgb_args(args: &str, with_alpha: bool) -> Option<Color> {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    if parts.len() != if with_alpha { 4 } else { 3 } {
        return None;
    }
    let channel = |p: &str| p.parse::<f32>().ok().filter(|v| (0.0..=255.0).contains(v));
    let mut color = Color::new(
        channel(parts[0])? / 255.0,
        channel(parts[1])? / 255.0,
        channel(parts[2])? / 255.0,
        1.0,
    );
    if with_alpha {
        color.a = parts[3].parse::<f32>().ok()?.clamp(0.0, 1.0);
    }
    Some(color)
}

fn named(name: &str) -> Option<Color> {
    Some(match name {
        "black" => Color::BLACK,
        "white" => Color::WHITE,
        "transparent" => Color::TRANSPARENT,
        "red" => Color::rgb(255, 0, 0),
        "green" => Color::rgb(0, 128, 0),
        "blue" => Color::rgb(0, 0, 255),
        "yellow" => Color::rgb(255, 255, 0),
        "gray" | "grey" => Color::rgb(128, 128, 128),
        _ => return None,
    })
}

impl PropertyType for Color {
    const INTERPOLATABLE: bool = true;

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_str()?.parse().ok()
    }

    fn lerp(&self, other: &Self, t: f64) -> Self {
        let t = t as f32;
        Color::new(
            self.r + (other.r - self.r) * t,
            self.g + (other.g - self.g) * t,
            self.b + (other.b - self.b) * t,
            self.a + (other.a - self.a) * t,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("#fff".parse::<Color>().unwrap(), Color::WHITE);
        assert_eq!("#FF0000".parse::<Color>().unwrap(), Color::rgb(255, 0, 0));
        assert_eq!(
            "#00000080".parse::<Color>().unwrap().a,
            128.0 / 255.0
        );
        assert_eq!(
            "rgba(0, 0, 255, 0.5)".parse::<Color>().unwrap(),
            Color::rgb(0, 0, 255).with_alpha(0.5)
        );
        assert_eq!("rgb(255,255,255)".parse::<Color>().unwrap(), Color::WHITE);
        assert_eq!("transparent".parse::<Color>().unwrap(), Color::TRANSPARENT);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("#12".parse::<Color>().is_err());
        assert!("rgb(1,2)".parse::<Color>().is_err());
        assert!("rgb(300,0,0)".parse::<Color>().is_err());
        assert!("chartreuse-ish".parse::<Color>().is_err());
    }

    #[test]
    fn test_lerp_midpoint() {
        let mid = Color::BLACK.lerp(&Color::WHITE, 0.5);
        assert_eq!(mid, Color::new(0.5, 0.5, 0.5, 1.0));
        assert_eq!(Color::WHITE.to_rgba8(0.5), [255, 255, 255, 128]);
    }
}
