mod wei;

pub use wei::WeiNewtype;

/// Base units per native coin, the chain uses 18 decimals like ether.
pub const WEI_PER_NATIVE: u64 = 1_000_000_000_000_000_000;
