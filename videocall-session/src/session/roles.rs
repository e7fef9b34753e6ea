/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Partner selection and offer/answer role assignment.
//!
//! `seniors` is the set of participants that were already in the room when
//! this side's join was confirmed and have not left since. `None` means the
//! join was assumed without a roster naming us; both sides then fall back to
//! name order.

use crate::state::Role;

/// Choose who to negotiate with. Members that were here before us win over
/// newcomers; ties go to name order.
pub(crate) fn select_partner(
    local: &str,
    participants: &[String],
    seniors: Option<&[String]>,
) -> Option<String> {
    let others = participants.iter().filter(|p| p.as_str() != local);
    let senior = seniors.and_then(|seniors| {
        others
            .clone()
            .filter(|p| seniors.contains(p))
            .min()
            .cloned()
    });
    senior.or_else(|| others.min().cloned())
}

/// The member that was here first offers; the one that joined answers.
pub(crate) fn derive_role(local: &str, peer: &str, seniors: Option<&[String]>) -> Role {
    match seniors {
        Some(seniors) if seniors.iter().any(|s| s == peer) => Role::Responder,
        Some(_) => Role::Initiator,
        None if local < peer => Role::Initiator,
        None => Role::Responder,
    }
}

/// Both sides offered at once: the lower name keeps offering.
pub(crate) fn keeps_initiator_on_glare(local: &str, peer: &str) -> bool {
    local < peer
}
