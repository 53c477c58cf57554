use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// An sRGB paint color, written as `#RRGGBB`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PaintColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PaintColor {
    pub const GRAY: PaintColor = PaintColor::rgb(0x80, 0x80, 0x80);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for PaintColor {
    fn default() -> Self {
        Self::GRAY
    }
}

impl fmt::Display for PaintColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl FromStr for PaintColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected #RRGGBB, got {s:?}"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("bad color {s:?}: {e}"))
        };
        Ok(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for PaintColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PaintColor> for String {
    fn from(color: PaintColor) -> Self {
        color.to_string()
    }
}

/// Painting choices made in the UI. The pipeline stores them for the
/// renderer and never reads them itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaintSettings {
    paint_color: PaintColor,
    class_colors: HashMap<u32, PaintColor>,
    selected_class: Option<u32>,
}

impl PaintSettings {
    pub fn new(paint_color: PaintColor) -> Self {
        Self {
            paint_color,
            ..Default::default()
        }
    }

    pub fn paint_color(&self) -> PaintColor {
        self.paint_color
    }

    pub fn set_paint_color(&mut self, color: PaintColor) {
        self.paint_color = color;
    }

    pub fn set_class_color(&mut self, class: u32, color: PaintColor) {
        self.class_colors.insert(class, color);
    }

    pub fn reset_class_colors(&mut self) {
        self.class_colors.clear();
    }

    /// The custom color of `class`, or the paint color.
    pub fn class_color(&self, class: u32) -> PaintColor {
        self.class_colors
            .get(&class)
            .copied()
            .unwrap_or(self.paint_color)
    }

    /// `None` paints every class.
    pub fn select_class(&mut self, class: Option<u32>) {
        self.selected_class = class;
    }

    pub fn selected_class(&self) -> Option<u32> {
        self.selected_class
    }
}
