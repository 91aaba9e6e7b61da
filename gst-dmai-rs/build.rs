// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Build script for gst-dmai-rs.
//!
//! Generates `COMMIT_ID` and `BUILD_REL_DATE` for the plugin metadata in
//! `gst::plugin_define!`.

fn main() {
    gst_plugin_version_helper::info()
}
