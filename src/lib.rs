// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client-side BLE GATT session manager.
//!
//! Multiplexes scanning, connections, notification subscriptions and
//! single-shot GATT operations over one [`transport::BleTransport`] for a
//! single front end, reporting progress on event feeds.

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod port;
pub mod session;
pub mod transport;

pub use codec::{Codec, JsonCodec};
pub use command::{Command, CommandPort, Dispatcher, Event, EventChannel, Response};
pub use config::Config;
pub use error::{SessionError, SessionResult};
pub use port::{EventPump, EventSink, LinePort};
pub use session::{EventFeeds, SessionManager};
pub use transport::BleTransport;
