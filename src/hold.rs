use crate::model::Ms;

// ── Hold queue estimation ─────────────────────────────────────────

/// Everything needed to estimate when a queued patron gets the book.
/// `queue_position` and `total_licenses` must come from one consistent
/// snapshot of the license pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldRequest {
    pub start: Ms,
    /// `None` means the position is unknown; the patron is assumed to be
    /// at the end of the line.
    pub queue_position: Option<u32>,
    pub patrons_in_hold_queue: u32,
    pub total_licenses: u32,
    pub default_loan_period: Option<Ms>,
    pub default_reservation_period: Option<Ms>,
    /// End date supplied by the license source, if any.
    pub known_end: Option<Ms>,
}

/// Worst-case time at which the hold turns into a reservation, or `None`
/// when no upper bound exists.
///
/// A future `known_end` always wins. Otherwise the wait is measured in
/// license cycles of `loan + reservation`:
///
/// ```text
/// 4 licenses, position 21
///   after 1 cycle: 17
///         2      : 13
///         3      :  9
///         4      :  5
///         5      :  1
///         6      : available
/// ```
pub fn estimate(req: &HoldRequest, now: Ms) -> Option<Ms> {
    if let Some(end) = req.known_end
        && end > now
    {
        return Some(end);
    }

    let (Some(loan), Some(reservation)) = (req.default_loan_period, req.default_reservation_period)
    else {
        // Someone ahead may keep the book forever.
        return None;
    };

    let position = req.queue_position.unwrap_or(req.patrons_in_hold_queue);
    if position == 0 {
        // Already reserved for this patron.
        return Some(req.start.saturating_add(reservation));
    }

    let cycles = estimate_cycles(position, req.total_licenses)?;
    let cycle_period = loan.saturating_add(reservation);
    let wait = cycle_period.saturating_mul(Ms::try_from(cycles).unwrap_or(Ms::MAX));
    Some(req.start.saturating_add(wait))
}

/// Number of full loan+reservation cycles a patron at `position` waits.
/// `None` when there are no licenses at all.
pub fn estimate_cycles(position: u32, total_licenses: u32) -> Option<u64> {
    if position == 0 {
        return Some(0);
    }
    if total_licenses == 0 {
        return None;
    }

    // The patron ahead borrows at the last minute and keeps the book for
    // the full period: this happens at least once.
    let mut cycles: u64 = 1;
    if position > total_licenses {
        cycles += u64::from(position / total_licenses);
        if total_licenses > 1 && position % total_licenses == 0 {
            cycles -= 1;
        }
    }
    Some(cycles)
}

// ── Entity wrappers ──────────────────────────────────────────────

/// Library policy durations. Either being `None` means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoanPolicy {
    pub default_loan_period: Option<Ms>,
    pub default_reservation_period: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LicensePoolSnapshot {
    pub licenses_owned: u32,
    pub patrons_in_hold_queue: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loan {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl Loan {
    /// The known end of the loan, or an estimate from the policy.
    pub fn until(&self, now: Ms, default_loan_period: Option<Ms>) -> Option<Ms> {
        if self.end.is_some() {
            return self.end;
        }
        let period = default_loan_period?;
        Some(self.start.unwrap_or(now).saturating_add(period))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hold {
    pub start: Option<Ms>,
    /// Once the hold becomes a reservation, the time the patron loses
    /// their place. Before that, an estimate from the license source.
    pub end: Option<Ms>,
    pub position: Option<u32>,
}

impl Hold {
    /// Rough worst-case estimate of when the book is available to this
    /// patron. The license could still expire first.
    pub fn until(&self, now: Ms, pool: &LicensePoolSnapshot, policy: &LoanPolicy) -> Option<Ms> {
        estimate(
            &HoldRequest {
                start: now,
                queue_position: self.position,
                patrons_in_hold_queue: pool.patrons_in_hold_queue,
                total_licenses: pool.licenses_owned,
                default_loan_period: policy.default_loan_period,
                default_reservation_period: policy.default_reservation_period,
                known_end: self.end,
            },
            now,
        )
    }

    /// Apply a status update from the license source. `None` leaves the
    /// field as it was.
    pub fn update(&mut self, start: Option<Ms>, end: Option<Ms>, position: Option<u32>) {
        if start.is_some() {
            self.start = start;
        }
        if end.is_some() {
            self.end = end;
        }
        if position.is_some() {
            self.position = position;
        }
    }
}
