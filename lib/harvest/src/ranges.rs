use serde::{Deserialize, Serialize};

use crate::RangeError;

/// Half-open byte span `[start, end)`, serialized as `[start, end]`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    fn contains(&self, start: u64, end: u64) -> bool {
        self.start <= start && end <= self.end
    }
}

impl From<(u64, u64)> for Span {
    fn from((start, end): (u64, u64)) -> Self {
        Span { start, end }
    }
}

impl From<Span> for (u64, u64) {
    fn from(span: Span) -> Self {
        (span.start, span.end)
    }
}

/// The byte spans of a growing file which are not yet confirmed parsed.
///
/// Spans are sorted, non-empty and never touch each other. Only the end of the
/// last span moves forward as the file grows; consuming removes bytes from
/// wherever the parser reports it decoded them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(try_from = "Vec<Span>", into = "Vec<Span>")]
pub struct UnprocessedRanges {
    spans: Vec<Span>,
}

impl UnprocessedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    #[inline]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Total number of bytes waiting to be parsed.
    pub fn pending(&self) -> u64 {
        self.spans.iter().map(Span::len).sum()
    }

    pub fn last_end(&self) -> Option<u64> {
        self.spans.last().map(|span| span.end)
    }

    /// Record that the file grew from `last_size` to `next_size` bytes.
    ///
    /// `last_size` is the size observed when the file was last handed to the
    /// parser. Every growth event must be observed, since bytes between the
    /// tracked end and `last_size` are taken as already parsed.
    pub fn extend(&mut self, last_size: u64, next_size: u64) -> Result<(), RangeError> {
        if next_size < last_size {
            return Err(RangeError::Regression {
                last: last_size,
                next: next_size,
            });
        }

        match self.spans.last_mut() {
            None => {
                if last_size < next_size {
                    self.spans.push(Span {
                        start: last_size,
                        end: next_size,
                    });
                }
            }
            Some(last) if last.end < next_size => {
                if last_size > last.end {
                    self.spans.push(Span {
                        start: last_size,
                        end: next_size,
                    });
                } else if last_size == last.end {
                    last.end = next_size;
                } else {
                    return Err(RangeError::Behind {
                        last: last_size,
                        end: last.end,
                    });
                }
            }
            // nothing new beyond what is already tracked
            Some(_) => {}
        }

        Ok(())
    }

    /// Mark `[start, end)` as parsed. The span must lie inside a single tracked
    /// range; a span in the middle splits it in two.
    pub fn consume(&mut self, start: u64, end: u64) -> Result<(), RangeError> {
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        if start == end {
            return Ok(());
        }

        let index = self.spans.partition_point(|span| span.end <= start);
        let Some(span) = self.spans.get_mut(index) else {
            return Err(RangeError::Untracked { start, end });
        };
        if !span.contains(start, end) {
            return Err(RangeError::Untracked { start, end });
        }

        match (span.start == start, span.end == end) {
            (true, true) => {
                self.spans.remove(index);
            }
            (true, false) => span.start = end,
            (false, true) => span.end = start,
            (false, false) => {
                let tail = Span {
                    start: end,
                    end: span.end,
                };
                span.end = start;
                self.spans.insert(index + 1, tail);
            }
        }

        Ok(())
    }
}

impl TryFrom<Vec<Span>> for UnprocessedRanges {
    type Error = RangeError;

    fn try_from(spans: Vec<Span>) -> Result<Self, Self::Error> {
        let mut previous: Option<Span> = None;

        for span in &spans {
            if span.start >= span.end {
                return Err(RangeError::Inverted {
                    start: span.start,
                    end: span.end,
                });
            }

            if let Some(previous) = previous {
                if span.start <= previous.end {
                    return Err(RangeError::Overlap {
                        start: span.start,
                        end: span.end,
                    });
                }
            }

            previous = Some(*span);
        }

        Ok(UnprocessedRanges { spans })
    }
}

impl From<UnprocessedRanges> for Vec<Span> {
    fn from(ranges: UnprocessedRanges) -> Self {
        ranges.spans
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    use super::*;

    fn spans(ranges: &UnprocessedRanges) -> Vec<(u64, u64)> {
        ranges.spans().iter().map(|span| (span.start, span.end)).collect()
    }

    #[test]
    fn grow_from_empty() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(100, 300).unwrap();
        assert_eq!(spans(&ranges), vec![(100, 300)]);

        // no growth, nothing to track
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(300, 300).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn consumed_bytes_are_never_reincluded() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(100, 300).unwrap();
        ranges.consume(100, 250).unwrap();
        assert_eq!(spans(&ranges), vec![(250, 300)]);

        ranges.extend(300, 400).unwrap();
        assert_eq!(spans(&ranges), vec![(250, 400)]);
    }

    #[test]
    fn gap_after_parsed_tail() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(0, 100).unwrap();
        ranges.consume(0, 80).unwrap();
        ranges.extend(150, 200).unwrap();

        assert_eq!(spans(&ranges), vec![(80, 100), (150, 200)]);
        assert_eq!(ranges.pending(), 70);
    }

    #[test]
    fn no_growth_beyond_tracked_end() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(0, 100).unwrap();
        ranges.extend(100, 100).unwrap();
        ranges.extend(50, 80).unwrap();

        assert_eq!(spans(&ranges), vec![(0, 100)]);
    }

    #[test]
    fn regression_is_fatal() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(0, 100).unwrap();

        assert_eq!(
            ranges.extend(100, 40),
            Err(RangeError::Regression {
                last: 100,
                next: 40
            })
        );
        assert_eq!(
            ranges.extend(60, 200),
            Err(RangeError::Behind { last: 60, end: 100 })
        );
        assert_eq!(spans(&ranges), vec![(0, 100)]);
    }

    #[test]
    fn consume_splits_and_rejects_untracked() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(0, 100).unwrap();

        ranges.consume(40, 60).unwrap();
        assert_eq!(spans(&ranges), vec![(0, 40), (60, 100)]);

        assert_eq!(
            ranges.consume(30, 70),
            Err(RangeError::Untracked { start: 30, end: 70 })
        );
        assert_eq!(
            ranges.consume(100, 120),
            Err(RangeError::Untracked {
                start: 100,
                end: 120
            })
        );
        assert_eq!(
            ranges.consume(20, 10),
            Err(RangeError::Inverted { start: 20, end: 10 })
        );

        ranges.consume(60, 100).unwrap();
        ranges.consume(0, 40).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn serde() {
        let mut ranges = UnprocessedRanges::new();
        ranges.extend(0, 100).unwrap();
        ranges.consume(10, 20).unwrap();

        let text = serde_json::to_string(&ranges).unwrap();
        assert_eq!(text, "[[0,10],[20,100]]");
        let got: UnprocessedRanges = serde_json::from_str(&text).unwrap();
        assert_eq!(got, ranges);

        assert!(serde_json::from_str::<UnprocessedRanges>("[[0,10],[5,20]]").is_err());
        assert!(serde_json::from_str::<UnprocessedRanges>("[[0,10],[10,20]]").is_err());
        assert!(serde_json::from_str::<UnprocessedRanges>("[[10,10]]").is_err());
    }

    #[derive(Clone, Debug)]
    enum Action {
        Grow(u64),
        Consume(u64),
    }

    impl Arbitrary for Action {
        fn arbitrary(g: &mut Gen) -> Self {
            let amount = u64::from(u8::arbitrary(g));
            if bool::arbitrary(g) {
                Action::Grow(amount)
            } else {
                Action::Consume(amount)
            }
        }
    }

    // A parser model which always consumes from the front of the first span.
    // Whatever happens, every byte is either pending or parsed exactly once.
    #[test]
    fn qc_bytes_are_accounted_once() {
        fn inner(actions: Vec<Action>) -> TestResult {
            let mut ranges = UnprocessedRanges::new();
            let mut size = 0u64;
            let mut parsed = 0u64;

            for action in actions {
                match action {
                    Action::Grow(amount) => {
                        let next = size + amount;
                        if ranges.extend(size, next).is_err() {
                            return TestResult::failed();
                        }
                        size = next;
                    }
                    Action::Consume(amount) => {
                        let Some(first) = ranges.spans().first().copied() else {
                            continue;
                        };
                        let end = (first.start + amount).min(first.end);
                        if ranges.consume(first.start, end).is_err() {
                            return TestResult::failed();
                        }
                        parsed += end - first.start;
                    }
                }

                let spans = ranges.spans();
                if spans.iter().any(Span::is_empty)
                    || spans.windows(2).any(|pair| pair[0].end >= pair[1].start)
                {
                    return TestResult::failed();
                }
                if parsed + ranges.pending() != size {
                    return TestResult::failed();
                }
            }

            TestResult::passed()
        }

        QuickCheck::new()
            .tests(1000)
            .quickcheck(inner as fn(Vec<Action>) -> TestResult);
    }
}
