//! Managed-array hello world: fill an array of ints, print it, let the
//! collector reclaim everything at shutdown.

use marmot_gc::{Collector, gc_start, global};

fn fill_int_array(gc: &mut Collector, length: usize) -> *mut marmot_gc::GcArray {
    let array = gc
        .create_array(std::mem::size_of::<i32>(), length)
        .expect("array allocation failed");
    // SAFETY: the array is live and every index is below `length`.
    unsafe {
        for index in 0..length {
            (*array).write::<i32>(index, index as i32);
        }
    }
    array
}

fn main() {
    gc_start!();

    let length = 10;
    global::try_with(|gc| {
        let array = fill_int_array(gc, length);
        // SAFETY: the array is live and every index is below `length`.
        unsafe {
            for index in 0..length {
                println!("{}", (*array).read::<i32>(index));
            }
        }
    })
    .expect("collector was started");

    let reclaimed = global::stop().unwrap_or(0);
    eprintln!("reclaimed {reclaimed} bytes at shutdown");
}
