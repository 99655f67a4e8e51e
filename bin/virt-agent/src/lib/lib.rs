// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod dispatch;
pub mod exec;
pub mod handlers;
pub mod pages;
pub mod probe;
pub mod provision;
pub mod router;
pub mod server;
pub mod snapshot;
