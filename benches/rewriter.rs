//! Benchmarks for the weaving pipeline.
//!
//! Measures the steps a closure pass performs per module:
//! - Decoding a method body
//! - Rewriting one method
//! - Patching every eligible method of a module
//! - Structural verification
//! - Serialising and parsing the patched image

extern crate cilweave;

use std::{hint::black_box, path::Path};

use cilweave::{
    assembly::decode_stream,
    metadata::{
        flags::{MethodAttributes, MethodImplAttributes, TypeAttributes},
        identity::ModuleVersion,
        method::MethodBodyBuilder,
        module::Module,
        signatures::{MethodSignature, TypeSig},
        token::Token,
    },
    verify::verify_module,
    weaver::{build_support_module, rewrite_method, BridgeImports, MockInjector, SupportIdentity},
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

/// A module with `types` classes of `methods` static methods, each summing its two arguments
/// `iterations` times in a counted loop.
fn sample_module(types: usize, methods: usize, iterations: i32) -> Module {
    let mut module = Module::new("Bench.Sample", ModuleVersion::new(1, 0, 0, 0));
    let object = module.import_core_type("System", "Object");

    for t in 0..types {
        let ty = module.add_type(
            "Bench",
            &format!("Worker{t}"),
            TypeAttributes::PUBLIC,
            Some(object),
        );
        for m in 0..methods {
            let body = MethodBodyBuilder::new()
                .local(TypeSig::I4)
                .local(TypeSig::I4)
                .implementation(move |asm| {
                    asm.emit_ldc_i4(0)?;
                    asm.emit_stloc(0)?;
                    asm.emit_ldc_i4(0)?;
                    asm.emit_stloc(1)?;
                    asm.emit_branch("br", "check")?;
                    asm.define_label("loop")?;
                    asm.emit_ldloc(0)?;
                    asm.emit_ldarg(0)?;
                    asm.emit_ldarg(1)?;
                    asm.emit_instruction("add", None)?;
                    asm.emit_instruction("add", None)?;
                    asm.emit_stloc(0)?;
                    asm.emit_ldloc(1)?;
                    asm.emit_ldc_i4(1)?;
                    asm.emit_instruction("add", None)?;
                    asm.emit_stloc(1)?;
                    asm.define_label("check")?;
                    asm.emit_ldloc(1)?;
                    asm.emit_ldc_i4(iterations)?;
                    asm.emit_branch("blt", "loop")?;
                    asm.emit_ldloc(0)?;
                    asm.emit_ret(true)
                })
                .build()
                .unwrap();
            module
                .add_method(
                    ty,
                    &format!("Sum{m}"),
                    MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    MethodImplAttributes::IL,
                    MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
                    Some(body),
                )
                .unwrap();
        }
    }

    module
}

fn injector() -> MockInjector {
    let support = build_support_module().unwrap();
    let image = support.to_bytes().unwrap();
    MockInjector::from_support(&support, &image, Path::new(".")).unwrap()
}

fn first_method(module: &Module) -> Token {
    module
        .methods
        .iter()
        .find(|m| m.name == "Sum0")
        .map(|m| m.token)
        .unwrap()
}

/// Benchmark decoding one method body.
fn bench_decode_body(c: &mut Criterion) {
    let module = sample_module(1, 1, 10);
    let code = module
        .method(first_method(&module))
        .and_then(|m| m.body.as_ref())
        .unwrap()
        .code
        .clone();

    c.bench_function("decode_body", |b| {
        b.iter(|| {
            let instructions = decode_stream(black_box(&code)).unwrap();
            black_box(instructions)
        });
    });
}

/// Benchmark inserting the prologue into one method.
fn bench_rewrite_method(c: &mut Criterion) {
    let support = SupportIdentity::of(&build_support_module().unwrap());
    let module = sample_module(1, 1, 10);
    let token = first_method(&module);

    c.bench_function("rewrite_method", |b| {
        b.iter_batched(
            || {
                let mut module = module.clone();
                let imports = BridgeImports::import(&mut module, &support);
                (module, imports)
            },
            |(mut module, imports)| {
                rewrite_method(&mut module, token, &imports).unwrap();
                black_box(module)
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark patching a module of 20 types with 10 methods each.
fn bench_patch_module(c: &mut Criterion) {
    let injector = injector();
    let module = sample_module(20, 10, 10);

    c.bench_function("patch_module_200_methods", |b| {
        b.iter_batched(
            || module.clone(),
            |mut module| {
                let count = injector.patch(&mut module, &[]).unwrap();
                black_box(count)
            },
            BatchSize::LargeInput,
        );
    });
}

/// Benchmark verifying a patched module.
fn bench_verify_patched(c: &mut Criterion) {
    let mut module = sample_module(20, 10, 10);
    injector().patch(&mut module, &[]).unwrap();

    c.bench_function("verify_patched_200_methods", |b| {
        b.iter(|| verify_module(black_box(&module)).unwrap());
    });
}

/// Benchmark serialising and re-parsing a patched module.
fn bench_image_roundtrip(c: &mut Criterion) {
    let mut module = sample_module(20, 10, 10);
    injector().patch(&mut module, &[]).unwrap();

    c.bench_function("image_write", |b| {
        b.iter(|| black_box(module.to_bytes().unwrap()));
    });

    let image = module.to_bytes().unwrap();
    c.bench_function("image_parse", |b| {
        b.iter(|| black_box(Module::parse(black_box(&image)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_decode_body,
    bench_rewrite_method,
    bench_patch_module,
    bench_verify_patched,
    bench_image_roundtrip
);
criterion_main!(benches);
