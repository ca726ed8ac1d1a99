#![no_main]
use libfuzzer_sys::fuzz_target;

use codelayout::{self, AnalysisError, ImageError, LayoutError, LayoutOptions};
use minilayout::{test_framework as ir, validator};

fuzz_target!(|func: ir::Func| {
    let module = ir::Module::single(func);
    if validator::validate_module(&module).is_err() {
        return;
    }
    module.print();

    // Short branches, so that restarts actually happen.
    let encoder = ir::ToyEncoder { branch_bits: 10, call_bits: 12 };
    let platform = ir::ToyPlatform::default();
    let options = LayoutOptions::default();

    let layout = match codelayout::layout_image(
        &module.funcs,
        &module.data,
        &encoder,
        &platform,
        &options,
    ) {
        Ok(layout) => layout,
        Err(err) => {
            match &err {
                LayoutError::Analysis(AnalysisError::InvariantViolation(_))
                | LayoutError::Image(ImageError::Inconsistency { .. }) => {
                    panic!("fuzz_layout.rs: internal error: {}", err);
                }
                _ => {}
            }
            println!("layout error: {}", err);
            return;
        }
    };

    if let Err(msg) = validator::validate_layout(&module, &platform, &layout) {
        panic!("fuzz_layout.rs: bad layout: {}", msg);
    }
});
