/* Copyright 2026- The Courier team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Domain types, service seams, and configuration for the Courier
//! direct-messaging relay.
//!
//! This crate holds the transport-agnostic core: the wire [`Envelope`],
//! the durable [`StoredMessage`] model, the narrow traits the relay
//! consumes ([`Transport`], [`SessionVerifier`], [`UserResolver`],
//! [`MessageStore`]), and process [`settings`]. The server crate provides
//! the adapters.
//!
//! [`Envelope`]: envelope::Envelope
//! [`StoredMessage`]: messaging::StoredMessage
//! [`Transport`]: messaging::Transport
//! [`SessionVerifier`]: messaging::SessionVerifier
//! [`UserResolver`]: messaging::UserResolver
//! [`MessageStore`]: messaging::MessageStore

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod messaging;
pub mod settings;
