//! Maps raw bitcoind/Electrum broadcast-rejection substrings to a
//! human-readable reason, used only by `broadcast_transaction`'s sanitized
//! error path.

const REASONS: &[(&str, &str)] = &[
    ("dust", "transaction output is below the dust threshold"),
    ("Missing inputs", "transaction spends inputs that are missing or already spent"),
    ("insufficient priority", "fee too low for immediate relay"),
    ("bad-txns-premature-spend-of-coinbase", "attempted to spend an immature coinbase output"),
    ("txn-already-in-mempool", "transaction is already in the mempool"),
    ("txn-mempool-conflict", "transaction conflicts with another in the mempool"),
    ("bad-txns-nonstandard-inputs", "transaction spends a non-standard input"),
    ("absurdly-high-fee", "fee is absurdly high"),
    ("non-mandatory-script-verify-flag", "script failed a non-mandatory verification flag"),
    ("tx-size", "transaction exceeds the maximum standard size"),
    ("scriptsig-size", "input script is too large"),
    ("scriptpubkey", "output script is non-standard"),
    ("bare-multisig", "bare multisig outputs are non-standard"),
    ("multi-op-return", "more than one OP_RETURN output"),
    ("scriptsig-not-pushonly", "input script contains non-push operations"),
];

/// Rewrites a raw broadcast-rejection message into something presentable,
/// falling back to the raw message verbatim when no known substring matches.
pub fn sanitize_broadcast_error(raw: &str) -> String {
    for (needle, reason) in REASONS {
        if raw.contains(needle) {
            return reason.to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_known_substrings() {
        assert_eq!(
            sanitize_broadcast_error("258: txn-mempool-conflict"),
            "transaction conflicts with another in the mempool"
        );
    }

    #[test]
    fn falls_back_to_raw_message() {
        assert_eq!(sanitize_broadcast_error("totally unknown error"), "totally unknown error");
    }

    #[test]
    fn matches_first_substring_when_multiple_could_apply() {
        assert_eq!(sanitize_broadcast_error("dust"), "transaction output is below the dust threshold");
    }
}
