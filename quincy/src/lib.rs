// SPDX-License-Identifier: GPL-3.0-or-later

pub mod args;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod modes;
pub mod pipeline;
pub mod report;
pub mod status;
pub mod store;
pub mod submission;
