pub mod mock_dialer;
pub mod mock_h3_peer;
