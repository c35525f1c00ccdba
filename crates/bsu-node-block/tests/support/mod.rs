pub mod mock_crypto;
pub mod mock_mounter;
