/*
 * SPDX-FileCopyrightText: 2024 MailWarden Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Concrete hosted-mailbox providers.

pub mod gmail;
pub mod microsoft;

pub use gmail::GmailProvider;
pub use microsoft::MicrosoftProvider;
