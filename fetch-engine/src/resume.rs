//! Resume planning.
//!
//! A pure decision from local file sizes and the transport's probe result.
//! The only I/O involved is the stat calls the caller performs to fill in
//! [`PlanInput`]. Invariant: following the returned plan yields a local file
//! whose length equals the probed remote size before verification runs.

/// Default minimum partial size worth resuming. Below this the partial is
/// discarded and the download restarts.
pub const DEFAULT_RESUME_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Inputs to the planner, gathered by the file task.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput {
    /// Size of the completed file at the target path, if present.
    pub final_len: Option<u64>,
    /// Size of the `.part` sibling, if present.
    pub part_len: Option<u64>,
    /// Remote size from the probe. The server is authoritative.
    pub remote_size: Option<u64>,
    /// Whether the probe advertised byte-range support.
    pub supports_range: bool,
    /// Whether the record's last verification failed.
    pub prior_verify_failed: bool,
    /// Minimum partial size worth continuing.
    pub resume_threshold: u64,
}

/// The transfer decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    /// Download from byte zero, truncating any partial data.
    Fresh,
    /// Continue the `.part` file from the given offset.
    Resume { from: u64 },
    /// The completed file is already the right length; verify it only.
    VerifyFinal,
    /// The `.part` file is already the full length; verify and finalize it.
    VerifyPart,
}

pub fn plan(input: &PlanInput) -> TransferPlan {
    if input.prior_verify_failed {
        return TransferPlan::Fresh;
    }

    if let (Some(final_len), Some(remote)) = (input.final_len, input.remote_size) {
        if final_len == remote {
            return TransferPlan::VerifyFinal;
        }
    }

    let Some(part_len) = input.part_len else {
        return TransferPlan::Fresh;
    };
    let Some(remote) = input.remote_size else {
        // Unknown remote size: a partial cannot be validated, start over.
        return TransferPlan::Fresh;
    };

    if part_len == remote {
        return TransferPlan::VerifyPart;
    }
    if part_len > remote {
        return TransferPlan::Fresh;
    }
    if part_len >= input.resume_threshold && input.supports_range {
        return TransferPlan::Resume { from: part_len };
    }
    TransferPlan::Fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PlanInput {
        PlanInput {
            final_len: None,
            part_len: None,
            remote_size: Some(10 * 1024 * 1024),
            supports_range: true,
            prior_verify_failed: false,
            resume_threshold: DEFAULT_RESUME_THRESHOLD,
        }
    }

    #[test]
    fn test_no_local_file_is_fresh() {
        assert_eq!(plan(&input()), TransferPlan::Fresh);
    }

    #[test]
    fn test_matching_final_file_verifies_only() {
        let mut i = input();
        i.final_len = Some(10 * 1024 * 1024);
        assert_eq!(plan(&i), TransferPlan::VerifyFinal);
    }

    #[test]
    fn test_large_partial_resumes() {
        let mut i = input();
        i.part_len = Some(3 * 1024 * 1024);
        assert_eq!(plan(&i), TransferPlan::Resume { from: 3 * 1024 * 1024 });
    }

    #[test]
    fn test_small_partial_restarts() {
        let mut i = input();
        i.part_len = Some(1024 * 1024);
        assert_eq!(plan(&i), TransferPlan::Fresh);
    }

    #[test]
    fn test_partial_without_range_support_restarts() {
        let mut i = input();
        i.part_len = Some(5 * 1024 * 1024);
        i.supports_range = false;
        assert_eq!(plan(&i), TransferPlan::Fresh);
    }

    #[test]
    fn test_oversized_partial_restarts() {
        let mut i = input();
        i.part_len = Some(11 * 1024 * 1024);
        assert_eq!(plan(&i), TransferPlan::Fresh);
    }

    #[test]
    fn test_unknown_remote_size_restarts() {
        let mut i = input();
        i.part_len = Some(5 * 1024 * 1024);
        i.remote_size = None;
        assert_eq!(plan(&i), TransferPlan::Fresh);
    }

    #[test]
    fn test_complete_partial_verifies() {
        let mut i = input();
        i.part_len = Some(10 * 1024 * 1024);
        assert_eq!(plan(&i), TransferPlan::VerifyPart);
    }

    #[test]
    fn test_prior_verify_failure_forces_fresh() {
        let mut i = input();
        i.final_len = Some(10 * 1024 * 1024);
        i.prior_verify_failed = true;
        assert_eq!(plan(&i), TransferPlan::Fresh);
    }
}
