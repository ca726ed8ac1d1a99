#![no_main]
use libfuzzer_sys::fuzz_target;

use minilayout::{test_framework as ir, validator};

fuzz_target!(|func: ir::Func| {
    // Generated functions are well formed by construction.
    if let Err(msg) = validator::validate_func(&func) {
        func.print("rejected");
        panic!("fuzz_validator.rs: generated func is invalid: {}", msg);
    }
});
