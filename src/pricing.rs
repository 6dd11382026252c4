/// Price of a slot: `round(unit_price_per_hour * duration_minutes / 60)`,
/// halves rounded up, in integer currency units.
pub fn total_price(unit_price_per_hour: i64, duration_minutes: i64) -> i64 {
    let scaled = i128::from(unit_price_per_hour) * i128::from(duration_minutes);
    (scaled + 30).div_euclid(60) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_hours() {
        assert_eq!(total_price(120_000, 120), 240_000);
        assert_eq!(total_price(110_000, 60), 110_000);
    }

    #[test]
    fn fractional_hours() {
        assert_eq!(total_price(150_000, 90), 225_000);
        assert_eq!(total_price(100, 45), 75);
    }

    #[test]
    fn halves_round_up() {
        // 1 * 30 / 60 = 0.5
        assert_eq!(total_price(1, 30), 1);
        // 3 * 50 / 60 = 2.5
        assert_eq!(total_price(3, 50), 3);
        // 1 * 29 / 60 = 0.483
        assert_eq!(total_price(1, 29), 0);
    }

    #[test]
    fn free_court() {
        assert_eq!(total_price(0, 180), 0);
    }

    #[test]
    fn deterministic() {
        for _ in 0..3 {
            assert_eq!(total_price(135_000, 150), 337_500);
        }
    }
}
