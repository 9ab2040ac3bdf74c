// Check that a non-Sync value type can't be used with `Map`.
// edition:2021

use hatchet::{Guarantee, Map};
use std::cell::RefCell;

fn main() {
    let m: Map<u64, RefCell<i32>> = Map::new(Guarantee::LockFree);
    //~^ ERROR: `RefCell<i32>` cannot be shared between threads safely
    m.put(&1, RefCell::new(0));
}
