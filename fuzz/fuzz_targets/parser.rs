#![no_main]
use libfuzzer_sys::fuzz_target;

use minilayout::{parser, test_framework as ir};

fuzz_target!(|func: ir::Func| {
    let mut printed = String::new();
    func.render(&mut printed);

    let module = match parser::parse_content("fuzz", &printed) {
        Ok(module) => module,
        Err(err) => {
            println!("{}", printed);
            panic!("fuzz_parser.rs: can't parse rendered func: {:?}", err);
        }
    };
    assert_eq!(module.funcs.len(), 1);

    let mut reprinted = String::new();
    module.funcs[0].render(&mut reprinted);
    assert_eq!(printed, reprinted);
});
