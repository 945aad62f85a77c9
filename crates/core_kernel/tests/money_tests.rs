//! Unit tests for the Money and Rate types
//!
//! Covers creation, rounding, arithmetic and the fee helpers used when
//! splitting a job total into owner, driver and platform shares.

use core_kernel::{Money, Currency, MoneyError, Rate};
use rust_decimal_macros::dec;

mod creation {
    use super::*;

    #[test]
    fn test_new_rounds_to_four_decimal_places() {
        let m = Money::new(dec!(100.123456789), Currency::USD);
        assert_eq!(m.amount(), dec!(100.1235));
    }

    #[test]
    fn test_from_minor_converts_cents_correctly() {
        let m = Money::from_minor(10050, Currency::USD);
        assert_eq!(m.amount(), dec!(100.50));
    }

    #[test]
    fn test_zero_is_not_positive() {
        let m = Money::zero(Currency::CAD);
        assert!(m.is_zero());
        assert!(!m.is_positive());
        assert_eq!(m.currency(), Currency::CAD);
    }
}

mod arithmetic {
    use super::*;

    #[test]
    fn test_checked_sub_same_currency() {
        let a = Money::new(dec!(250.00), Currency::USD);
        let b = Money::new(dec!(100.25), Currency::USD);
        assert_eq!(a.checked_sub(&b).unwrap().amount(), dec!(149.75));
    }

    #[test]
    fn test_checked_sub_currency_mismatch() {
        let a = Money::new(dec!(1), Currency::USD);
        let b = Money::new(dec!(1), Currency::MXN);
        assert_eq!(
            a.checked_sub(&b),
            Err(MoneyError::CurrencyMismatch("USD".to_string(), "MXN".to_string()))
        );
    }

    #[test]
    fn test_try_sum_empty_is_zero() {
        let parts: Vec<Money> = Vec::new();
        let total = Money::try_sum(&parts, Currency::USD).unwrap();
        assert!(total.is_zero());
    }

    #[test]
    fn test_try_sum_rejects_mixed_currencies() {
        let parts = vec![
            Money::new(dec!(10), Currency::USD),
            Money::new(dec!(10), Currency::CAD),
        ];
        assert!(Money::try_sum(&parts, Currency::USD).is_err());
    }

    #[test]
    fn test_multiply_by_hours() {
        let rate = Money::new(dec!(95.00), Currency::USD);
        assert_eq!(rate.multiply(dec!(7.5)).amount(), dec!(712.50));
    }
}

mod display {
    use super::*;

    #[test]
    fn test_display_uses_symbol_and_two_places() {
        assert_eq!(Money::new(dec!(1040), Currency::USD).to_string(), "$1040.00");
        assert_eq!(Money::new(dec!(3.5), Currency::CAD).to_string(), "C$3.50");
    }

    #[test]
    fn test_rate_display() {
        assert_eq!(Rate::new(dec!(0.06)).to_string(), "6.00%");
    }
}

mod rates {
    use super::*;

    #[test]
    fn test_from_percentage_round_trips() {
        let rate = Rate::from_percentage(dec!(3));
        assert_eq!(rate.as_decimal(), dec!(0.03));
        assert_eq!(rate.as_percentage(), dec!(3.00));
    }

    #[test]
    fn test_cash_advance_fee_on_net() {
        let fee = Rate::from_percentage(dec!(3));
        let net = Money::new(dec!(940.00), Currency::USD);
        assert_eq!(fee.apply(&net).round_to_currency().amount(), dec!(28.20));
    }

    #[test]
    fn test_zero_rate_leaves_amount_unchanged() {
        let none = Rate::new(dec!(0));
        let total = Money::new(dec!(512.34), Currency::USD);
        assert_eq!(none.deduct_from(&total), total);
        assert_eq!(none.compound(&total), total);
    }
}
