//! Scanner throughput over a synthetic chunk.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use luna_lexer::{ByteReader, Lexer, Token};

fn sample_chunk() -> String {
    let mut src = String::new();
    for i in 0..500 {
        src.push_str(&format!(
            "local v{i} = {i} + 0x{i:x} * 2.5 -- comment {i}\n\
             if v{i} >= 10 then v{i} = v{i} .. 'tail' end\n"
        ));
    }
    src
}

fn bench_lexer(c: &mut Criterion) {
    let src = sample_chunk();
    c.bench_function("scan_synthetic_chunk", |b| {
        b.iter(|| {
            let mut lx =
                Lexer::new(ByteReader::from_slice(black_box(src.as_bytes())), "=bench").unwrap();
            let mut count = 0usize;
            loop {
                lx.next_token().unwrap();
                if *lx.current_token() == Token::Eos {
                    break;
                }
                count += 1;
            }
            black_box(count)
        })
    });
}

criterion_group!(benches, bench_lexer);
criterion_main!(benches);
