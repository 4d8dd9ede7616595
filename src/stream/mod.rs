// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Incremental decode of the upstream event stream and the fragment
// hand-off to the client forwarder.
//
// Responsibilities:
// - Reassemble `data: ` event lines from arbitrary chunk boundaries
// - Extract text deltas; latch on the [DONE] terminator
// - Skip malformed event lines without dropping the turn
// - Hand fragments across the task boundary in decode order, with a
//   close signal distinct from "nothing buffered right now"

mod decoder;
mod relay;

pub use decoder::{EventStreamDecoder, Fragment};
pub use relay::{relay_channel, FragmentReceiver, FragmentSender};
