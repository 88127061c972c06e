#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use kma_hater::ResourceMapSubject;
use libfuzzer_sys::fuzz_target;

const MAX_NUM_PAGES: usize = 64;

#[derive(Clone, Debug)]
struct Args {
    num_pages: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let num_pages = usize::arbitrary(un)? % MAX_NUM_PAGES;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { num_pages, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { num_pages, ops } = args;

    // Zero pages selects the unbounded global provider.
    if num_pages == 0 {
        let mut eval = alloc_hater::Evaluator::new(ResourceMapSubject::new());
        eval.evaluate(ops).unwrap();
        return;
    }

    let map = match ResourceMapSubject::with_pool(num_pages) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(map);
    eval.evaluate(ops).unwrap();
});
