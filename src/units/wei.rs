use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign},
    str::FromStr,
};

use num_bigint::{BigUint, ParseBigIntError};
use num_traits::{Num, Zero};
use serde::{Deserialize, Serialize};

use super::WEI_PER_NATIVE;

/// Digits shown after the decimal point when formatting native units.
const NATIVE_DISPLAY_DECIMALS: usize = 6;
const NATIVE_DECIMALS: usize = 18;

// Genesis allocations on migrated chains routinely exceed what fits in 128 bits once summed, so
// balances are kept at arbitrary precision. When serializing, it defaults to a decimal string.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(into = "String")]
#[serde(try_from = "String")]
pub struct WeiNewtype(pub BigUint);

impl WeiNewtype {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn from_native(native: u64) -> Self {
        Self(BigUint::from(native) * BigUint::from(WEI_PER_NATIVE))
    }

    /// Parses a `0x` prefixed hex quantity, as returned by `eth_getBalance`.
    pub fn from_hex_quantity(quantity: &str) -> Result<Self, ParseBigIntError> {
        let digits = quantity
            .strip_prefix("0x")
            .or_else(|| quantity.strip_prefix("0X"))
            .unwrap_or(quantity);
        BigUint::from_str_radix(digits, 16).map(WeiNewtype)
    }

    /// Formats the amount in native units, e.g. `1000.000000`, truncating past six decimals.
    pub fn to_native_string(&self) -> String {
        let unit = BigUint::from(WEI_PER_NATIVE);
        let whole = &self.0 / &unit;
        let fraction = format!("{:0>width$}", (&self.0 % &unit).to_string(), width = NATIVE_DECIMALS);
        format!("{whole}.{}", &fraction[..NATIVE_DISPLAY_DECIMALS])
    }
}

impl Add<WeiNewtype> for WeiNewtype {
    type Output = Self;

    fn add(self, WeiNewtype(rhs): Self) -> Self::Output {
        let WeiNewtype(lhs) = self;
        WeiNewtype(lhs + rhs)
    }
}

impl AddAssign<&WeiNewtype> for WeiNewtype {
    fn add_assign(&mut self, rhs: &WeiNewtype) {
        self.0 += &rhs.0;
    }
}

impl<'a> Sum<&'a WeiNewtype> for WeiNewtype {
    fn sum<I: Iterator<Item = &'a WeiNewtype>>(iter: I) -> Self {
        iter.fold(WeiNewtype::zero(), |mut acc, amount| {
            acc += amount;
            acc
        })
    }
}

impl Display for WeiNewtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let WeiNewtype(amount) = self;
        write!(f, "{amount}")
    }
}

impl From<WeiNewtype> for String {
    fn from(WeiNewtype(amount): WeiNewtype) -> Self {
        amount.to_string()
    }
}

/// Accepts both decimal strings and `0x` prefixed hex, genesis files in the wild use either.
impl FromStr for WeiNewtype {
    type Err = ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("0x") || s.starts_with("0X") {
            Self::from_hex_quantity(s)
        } else {
            BigUint::from_str_radix(s, 10).map(WeiNewtype)
        }
    }
}

impl TryFrom<String> for WeiNewtype {
    type Error = ParseBigIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse::<WeiNewtype>()
    }
}

impl From<u64> for WeiNewtype {
    fn from(amount: u64) -> Self {
        WeiNewtype(BigUint::from(amount))
    }
}
