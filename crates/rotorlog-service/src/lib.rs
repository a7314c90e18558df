// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! On-device mission recording supervisor.
//!
//! Captures topic data into size-bounded bag segments through an external writer, detects
//! finished segments via filesystem events, and uploads them to an object store through
//! backend-issued signed URLs. The pipeline reconfigures itself live from a configuration
//! topic and cleans up local storage after successful uploads.

pub mod bag;
pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod recorder;
pub mod supervisor;
pub mod upload_manager;
pub mod uploader;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
