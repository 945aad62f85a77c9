//! Custom Test Assertions
//!
//! Assertion helpers for money and invoice trees with messages that name the
//! invoice that broke the invariant.

use rust_decimal::Decimal;

use core_kernel::Money;
use domain_invoicing::{DriverJobInvoice, InvoiceTree, JobInvoice, OwnerJobInvoice};

/// Asserts that a Money value has exactly `expected` as its amount
pub fn assert_money_eq(actual: &Money, expected: Decimal) {
    assert_eq!(
        actual.amount(),
        expected,
        "Expected {} {}, got {} {}",
        actual.currency().symbol(),
        expected,
        actual.currency().symbol(),
        actual.amount()
    );
}

/// Asserts that money values sum to a total
///
/// # Panics
///
/// Panics on a currency mismatch or if the sum doesn't equal the total
pub fn assert_money_sum_equals<'a>(parts: impl IntoIterator<Item = &'a Money>, total: &Money) {
    let sum = Money::try_sum(parts, total.currency()).expect("Currency mismatch in sum");
    assert_eq!(
        sum.amount(),
        total.amount(),
        "Sum of parts ({}) doesn't equal total ({})",
        sum.amount(),
        total.amount()
    );
}

/// Asserts that an owner invoice's net amount is the sum of its tickets
pub fn assert_owner_balances(owner: &OwnerJobInvoice, tickets: &[DriverJobInvoice]) {
    for ticket in tickets {
        assert_eq!(
            ticket.owner_invoice_id,
            owner.id,
            "Ticket #{} is not linked to owner invoice {}",
            ticket.ticket_number,
            owner.display_order_number()
        );
    }
    assert_money_sum_equals(tickets.iter().map(|t| &t.amount), &owner.net_amount);
}

/// Asserts that a job invoice's amount is the sum of its owner net amounts
pub fn assert_job_balances(job: &JobInvoice, owners: &[OwnerJobInvoice]) {
    for owner in owners {
        assert_eq!(
            owner.job_invoice_id, job.id,
            "Owner invoice {} is not linked to job invoice {}",
            owner.display_order_number(),
            job.order_number
        );
    }
    assert_money_sum_equals(owners.iter().map(|o| &o.net_amount), &job.amount);
}

/// Asserts every amount and link of a generated tree
pub fn assert_tree_balances(tree: &InvoiceTree) {
    let owners: Vec<_> = tree.owners.iter().map(|o| o.invoice.clone()).collect();
    assert_job_balances(&tree.job_invoice, &owners);
    for owner in &tree.owners {
        assert_owner_balances(&owner.invoice, &owner.tickets);
    }
}

/// Asserts that ticket numbers run 1..=n in order
pub fn assert_ticket_numbers_consecutive<'a>(tickets: impl IntoIterator<Item = &'a DriverJobInvoice>) {
    let numbers: Vec<u32> = tickets.into_iter().map(|t| t.ticket_number).collect();
    let expected: Vec<u32> = (1..=numbers.len() as u32).collect();
    assert_eq!(numbers, expected, "Ticket numbers are not consecutive from 1");
}

/// Asserts that a result is Ok and returns the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Asserts that a result is an Err matching a pattern
#[macro_export]
macro_rules! assert_err_matches {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err(ref e) if matches!(e, $pattern) => {}
            Err(e) => panic!("Error did not match {}: {:?}", stringify!($pattern), e),
            Ok(v) => panic!("Expected Err matching {}, got Ok({:?})", stringify!($pattern), v),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_kernel::Currency;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_sum_equals() {
        let parts = [
            Money::new(dec!(200), Currency::USD),
            Money::new(dec!(240), Currency::USD),
        ];
        assert_money_sum_equals(&parts, &Money::new(dec!(440), Currency::USD));
    }

    #[test]
    #[should_panic(expected = "doesn't equal total")]
    fn test_money_sum_mismatch_panics() {
        let parts = [Money::new(dec!(200), Currency::USD)];
        assert_money_sum_equals(&parts, &Money::new(dec!(201), Currency::USD));
    }

    #[test]
    fn test_assert_ok_returns_value() {
        let value: Result<u32, String> = Ok(3);
        assert_eq!(assert_ok!(value), 3);
    }
}
