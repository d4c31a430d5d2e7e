use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vip8::prelude::*;

// Tight loop that keeps redrawing a font glyph and never halts.
const ROM: &[u8] = &[
    0xA0, 0x00, // LD I, 0x000
    0x60, 0x00, // LD v0, 0
    0xD0, 0x05, // DRW v0, v0, 5
    0x12, 0x04, // JP 0x204
];

fn criterion_benchmark(c: &mut Criterion) {
    {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        vm.load_rom(ROM).unwrap();
        let mut screen = ScreenBuffer::new();

        c.bench_function("draw loop", |b| {
            b.iter(|| {
                let step_count = black_box(1000_usize);
                black_box(vm.run_steps(step_count, &mut screen))
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
