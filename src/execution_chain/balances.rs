use tracing::{debug, warn};

use crate::units::WeiNewtype;

use super::{ExecutionNode, RpcError};

#[derive(Debug)]
pub struct BalanceCheck {
    pub address: String,
    pub balance: Result<WeiNewtype, RpcError>,
}

/// Looks up the latest balance for every address. One failed lookup does not stop the others.
pub fn check_balances<N: ExecutionNode>(node: &N, addresses: &[String]) -> Vec<BalanceCheck> {
    addresses
        .iter()
        .map(|address| {
            let balance = node.get_balance(address);
            match &balance {
                Ok(balance) => debug!(address, %balance, "got balance"),
                Err(error) => warn!(address, %error, "failed to get balance"),
            }
            BalanceCheck {
                address: address.clone(),
                balance,
            }
        })
        .collect()
}

/// The treasury always goes first, extra addresses follow in the order given, duplicates of the
/// treasury are dropped.
pub fn addresses_to_check(treasury: &str, extra: &[String]) -> Vec<String> {
    let mut addresses = vec![treasury.to_string()];
    addresses.extend(
        extra
            .iter()
            .filter(|address| !address.eq_ignore_ascii_case(treasury))
            .cloned(),
    );
    addresses
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::execution_chain::MockExecutionNode;

    const TREASURY: &str = "0x9011E888251AB053B7bD1cdB598Db4f9DEd94714";

    #[test]
    fn addresses_to_check_test() {
        let extra = vec![
            "0x9011e888251ab053b7bd1cdb598db4f9ded94714".to_string(),
            "0x0000000000000000000000000000000000000001".to_string(),
        ];
        assert_eq!(
            addresses_to_check(TREASURY, &extra),
            vec![
                TREASURY.to_string(),
                "0x0000000000000000000000000000000000000001".to_string()
            ]
        );
    }

    #[test]
    fn check_balances_keeps_going_after_failure_test() {
        let mut node = MockExecutionNode::new();
        node.expect_get_balance()
            .with(eq("0xbad"))
            .returning(|_| {
                Err(RpcError::Timeout {
                    method: "eth_getBalance".to_string(),
                    timeout: std::time::Duration::from_secs(5),
                })
            });
        node.expect_get_balance()
            .returning(|_| Ok(WeiNewtype::from_native(1000)));

        let checks = check_balances(
            &node,
            &["0xbad".to_string(), TREASURY.to_string()],
        );

        assert_eq!(checks.len(), 2);
        assert!(checks[0].balance.is_err());
        assert_eq!(
            checks[1].balance.as_ref().unwrap(),
            &WeiNewtype::from_native(1000)
        );
    }
}
