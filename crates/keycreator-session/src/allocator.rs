//! Serial number window and counter.
//!
//! The six digit number space is cut into ranges of 100 000 numbers. Each
//! range is reserved for keys carrying a given technology mix. A
//! configuration may use every range whose mix covers all of its required
//! technologies; the window is the hull of those ranges.

use keycreator_core::constants::{NUMBER_MAX, NUMBER_MIN, NUMBER_RANGE_WIDTH};
use keycreator_core::Technology::{Deister, Em, Hitag1S, MifareClassic, MifareDesfire};
use keycreator_core::{Error, Result, SerialNumber, Technology, TechnologySet};
use std::fmt;
use tracing::{debug, info};

/// One range of the number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberRange {
    pub start: u32,
    pub technologies: &'static [Technology],
}

impl NumberRange {
    pub fn end(&self) -> u32 {
        self.start + NUMBER_RANGE_WIDTH - 1
    }

    pub fn supports(&self, required: &TechnologySet) -> bool {
        required.iter().all(|t| self.technologies.contains(&t))
    }
}

/// Technology mix of each range.
pub const NUMBER_RANGES: [NumberRange; 8] = [
    NumberRange { start: 100_000, technologies: &[Hitag1S] },
    NumberRange { start: 200_000, technologies: &[Hitag1S, MifareClassic] },
    NumberRange { start: 300_000, technologies: &[MifareClassic] },
    NumberRange { start: 400_000, technologies: &[MifareDesfire] },
    NumberRange { start: 500_000, technologies: &[Hitag1S, MifareDesfire] },
    NumberRange { start: 600_000, technologies: &[Deister] },
    NumberRange { start: 700_000, technologies: &[Em] },
    NumberRange { start: 800_000, technologies: &[Hitag1S, MifareClassic, MifareDesfire, Deister, Em] },
];

/// Inclusive bounds of the numbers a configuration may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberWindow {
    pub min: u32,
    pub max: u32,
}

impl NumberWindow {
    /// Window for `required`. Falls back to the full number space when no
    /// range carries the whole set.
    pub fn for_technologies(required: &TechnologySet) -> Self {
        let (min, max) = NUMBER_RANGES
            .iter()
            .filter(|range| range.supports(required))
            .fold((u32::MAX, 0), |(min, max), range| {
                (min.min(range.start), max.max(range.end()))
            });
        if min > max {
            return Self {
                min: NUMBER_MIN,
                max: NUMBER_MAX,
            };
        }
        Self { min, max }
    }

    pub fn contains(&self, number: SerialNumber) -> bool {
        (self.min..=self.max).contains(&number.value())
    }

    fn check(&self, number: SerialNumber) -> Result<SerialNumber> {
        if !self.contains(number) {
            return Err(Error::NumberOutOfRange {
                number: number.value(),
                min: self.min,
                max: self.max,
            });
        }
        Ok(number)
    }
}

impl fmt::Display for NumberWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}..={:06}", self.min, self.max)
    }
}

/// Current serial number of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberAllocator {
    window: NumberWindow,
    current: Option<SerialNumber>,
}

impl NumberAllocator {
    pub fn new(required: &TechnologySet) -> Self {
        let window = NumberWindow::for_technologies(required);
        info!(required = %required, window = %window, "Number window");
        Self {
            window,
            current: None,
        }
    }

    /// Check that `input` is exactly six digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_session::NumberAllocator;
    ///
    /// assert!(NumberAllocator::validate_number("012345").is_ok());
    /// assert!(NumberAllocator::validate_number("12345").is_err());
    /// ```
    pub fn validate_number(input: &str) -> Result<SerialNumber> {
        SerialNumber::parse(input.trim())
    }

    pub fn window(&self) -> NumberWindow {
        self.window
    }

    pub fn current(&self) -> Option<SerialNumber> {
        self.current
    }

    /// Validate `input` and make it the current number.
    ///
    /// # Errors
    ///
    /// `Error::InvalidNumber` for anything but six digits,
    /// `Error::NumberOutOfRange` outside the window.
    pub fn set_number(&mut self, input: &str) -> Result<SerialNumber> {
        let number = self.window.check(Self::validate_number(input)?)?;
        self.current = Some(number);
        debug!(number = %number, "Number set");
        Ok(number)
    }

    /// Current number, starting at the bottom of the window when unset.
    pub fn current_or_default(&mut self) -> Result<SerialNumber> {
        match self.current {
            Some(number) => Ok(number),
            None => {
                let number = SerialNumber::new(self.window.min)?;
                self.current = Some(number);
                Ok(number)
            }
        }
    }

    /// Advance by one and re-validate.
    ///
    /// # Errors
    ///
    /// Fails past 999999 or past the top of the window; the current number
    /// is left unchanged then.
    pub fn increment(&mut self) -> Result<SerialNumber> {
        let current = self.current_or_default()?;
        let next = self.window.check(current.next()?)?;
        self.current = Some(next);
        debug!(number = %next, "Number incremented");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn set(technologies: &[Technology]) -> TechnologySet {
        technologies.iter().copied().collect()
    }

    #[rstest]
    #[case("012345", true)]
    #[case("12345", false)]
    #[case("1234567", false)]
    #[case("12 456", false)]
    fn test_validate_number(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(NumberAllocator::validate_number(input).is_ok(), valid);
    }

    #[rstest]
    #[case(&[Hitag1S], 100_000, 899_999)]
    #[case(&[Hitag1S, MifareClassic], 200_000, 899_999)]
    #[case(&[MifareDesfire], 400_000, 899_999)]
    #[case(&[Em], 700_000, 899_999)]
    #[case(&[Deister, Em], 800_000, 899_999)]
    fn test_window_covers_supporting_ranges(
        #[case] required: &[Technology],
        #[case] min: u32,
        #[case] max: u32,
    ) {
        assert_eq!(
            NumberWindow::for_technologies(&set(required)),
            NumberWindow { min, max }
        );
    }

    #[test]
    fn test_increment_stays_in_window() {
        let mut allocator = NumberAllocator::new(&set(&[Hitag1S, MifareClassic]));
        assert_eq!(allocator.set_number("899998").unwrap().value(), 899_998);
        assert_eq!(allocator.increment().unwrap().value(), 899_999);
        assert!(matches!(
            allocator.increment(),
            Err(Error::NumberOutOfRange { .. })
        ));
        assert_eq!(allocator.current().unwrap().value(), 899_999);
    }

    #[test]
    fn test_number_below_window_is_refused() {
        let mut allocator = NumberAllocator::new(&set(&[MifareDesfire]));
        assert!(matches!(
            allocator.set_number("012345"),
            Err(Error::NumberOutOfRange { min: 400_000, .. })
        ));
        assert_eq!(allocator.current(), None);
        assert_eq!(allocator.current_or_default().unwrap().value(), 400_000);
    }

    proptest! {
        #[test]
        fn test_window_ranges_hold_every_required_technology(mask in 1u8..32) {
            let required: TechnologySet = Technology::ALL
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, t)| t)
                .collect();
            let window = NumberWindow::for_technologies(&required);
            prop_assert!(window.min <= window.max);
            for range in NUMBER_RANGES.iter().filter(|r| r.supports(&required)) {
                prop_assert!(window.min <= range.start && range.end() <= window.max);
            }
        }
    }
}
