//! Integration-test harness.
//!
//! A [`Suite`] owns one [`TestEnvironment`] and an isolated router running
//! the same middleware stack as production, with a synthetic identity and
//! fixed client parameters. Requests are built fluently and dispatched
//! in-process; [`TestResponse`] assertions fail the calling test.

pub mod html;
pub mod multipart;
pub mod request;
pub mod response;
pub mod suite;
pub mod xpath;

pub use html::{Element, Html};
pub use multipart::{Multipart, MultipartFile};
pub use request::{TestRequest, HX_REQUEST};
pub use response::{SetCookie, TestResponse};
pub use suite::{Suite, TestEnvironment, TestEnvironmentBuilder, TEST_IP, TEST_USER_AGENT};
pub use xpath::{XPath, XPathError};
