pub mod mock_cloud;
