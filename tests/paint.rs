use surface_segmenter::classes::{label, ADE20K, CEILING, FLOOR, WALL};
use surface_segmenter::paint::{PaintColor, PaintSettings};

#[test]
fn colors_parse_with_or_without_hash() {
    assert_eq!("#1A2b3C".parse::<PaintColor>().unwrap(), PaintColor::rgb(0x1A, 0x2B, 0x3C));
    assert_eq!("ffffff".parse::<PaintColor>().unwrap(), PaintColor::rgb(255, 255, 255));
    assert!("#fff".parse::<PaintColor>().is_err());
    assert!("#ééé".parse::<PaintColor>().is_err());
    assert!("#zz0000".parse::<PaintColor>().is_err());
}

#[test]
fn colors_display_as_uppercase_hex() {
    assert_eq!(PaintColor::rgb(1, 0xAB, 255).to_string(), "#01ABFF");
    assert_eq!(PaintColor::default(), PaintColor::GRAY);
}

#[test]
fn colors_serialize_as_strings() {
    let json = serde_json::to_string(&PaintColor::rgb(0x10, 0x20, 0x30)).unwrap();
    assert_eq!(json, "\"#102030\"");
    let color: PaintColor = serde_json::from_str("\"#102030\"").unwrap();
    assert_eq!(color, PaintColor::rgb(0x10, 0x20, 0x30));
    assert!(serde_json::from_str::<PaintColor>("\"blue\"").is_err());
}

#[test]
fn class_colors_fall_back_to_paint_color() {
    let red = PaintColor::rgb(255, 0, 0);
    let blue = PaintColor::rgb(0, 0, 255);
    let mut settings = PaintSettings::new(red);
    assert_eq!(settings.class_color(0), red);

    settings.set_class_color(3, blue);
    assert_eq!(settings.class_color(3), blue);
    assert_eq!(settings.class_color(0), red);

    settings.set_paint_color(PaintColor::GRAY);
    assert_eq!(settings.class_color(0), PaintColor::GRAY);
    assert_eq!(settings.class_color(3), blue);

    settings.reset_class_colors();
    assert_eq!(settings.class_color(3), PaintColor::GRAY);
}

#[test]
fn class_selection() {
    let mut settings = PaintSettings::default();
    assert_eq!(settings.selected_class(), None);
    settings.select_class(Some(5));
    assert_eq!(settings.selected_class(), Some(5));
    settings.select_class(None);
    assert_eq!(settings.selected_class(), None);
}

#[test]
fn surface_labels() {
    assert_eq!(ADE20K.len(), 150);
    assert_eq!(label(WALL), "wall");
    assert_eq!(label(FLOOR), "floor");
    assert_eq!(label(CEILING), "ceiling");
    assert_eq!(label(10_000), "unknown");
}
