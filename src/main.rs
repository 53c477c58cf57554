fn main() {
    surface_segmenter::run_cli();
}
