// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Core operator traits and upstream signalling.
//!
//! Responsibilities:
//! - Defines the operator lifecycle contract shared by pull-driven operators.
//! - Defines the input iterator an operator pulls from and its outcome vocabulary.
//!
//! Key exported interfaces:
//! - Types: `Operator`, `SortInput`, `InputEvent`.
//!
//! Current limitations:
//! - Transient out-of-memory from upstream is a side channel, not an outcome.
//! - `NotYet` is surfaced to operators that cannot wait as an explicit error.

use crate::common::error::Result;
use crate::exec::chunk::Chunk;

/// One upstream pull outcome.
#[derive(Debug)]
pub enum InputEvent {
    /// A batch of rows. The first batch fixes the schema.
    Batch(Chunk),
    /// Upstream is exhausted.
    End,
    /// Upstream stopped (failure or cancellation elsewhere in the fragment).
    Stop,
    /// Upstream has nothing right now and would need to be polled again.
    NotYet,
}

/// Upstream iterator consumed by an operator.
pub trait SortInput: Send {
    fn next(&mut self) -> Result<InputEvent>;

    /// Whether upstream hit the memory limit since the last call. Reading clears it.
    fn take_memory_pressure(&mut self) -> bool {
        false
    }

    /// Propagate cancellation upstream.
    fn kill(&mut self) {}
}

impl<T: SortInput + ?Sized> SortInput for Box<T> {
    fn next(&mut self) -> Result<InputEvent> {
        (**self).next()
    }

    fn take_memory_pressure(&mut self) -> bool {
        (**self).take_memory_pressure()
    }

    fn kill(&mut self) {
        (**self).kill()
    }
}

/// Base operator contract.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self) {
        // Default: nothing to cancel.
    }

    fn is_finished(&self) -> bool {
        false
    }
}
