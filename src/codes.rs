//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! Reply codes from RFC 5321 and RFC 4954.
//!
//! The module is designed to be wildcard-imported, and defines a submodule
//! with a short name for accessing the enum values in a consistent way.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    // In the order RFC 5321 defines them
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    CommandParameterNotImplemented = 504,
    ServiceReady = 220,
    ServiceClosing = 221,
    ServiceNotAvailableClosing = 421,
    Ok = 250,
    CannotVerify = 252,
    ActionNotTakenPermanent = 550,
    ExceededStorageAllocation = 552,
    StartMailInput = 354,
    TransactionFailed = 554,
    // RFC 4954
    AuthenticationSucceeded = 235,
    ServerChallenge = 334,
    TemporaryAuthenticationFailure = 454,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}
