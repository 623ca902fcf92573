pub mod bitmap;
pub mod phys;

pub use phys::{DirectMap, PhysAddr, PAGE_SIZE};

#[cfg(test)]
mod tests;
