// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
mod mock_transport;
mod projects;

pub(crate) use mock_transport::MockTransport;
pub(crate) use projects::{camera_project, controller_and_dmd, dmd_project};
