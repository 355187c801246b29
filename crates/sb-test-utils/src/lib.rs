// sb-test-utils: Shared test utilities for the socket bridge.
//
// Provides a mock market-data WebSocket server for integration testing of
// the bridge client without a real exchange endpoint.

pub mod mock_market_server;

pub use mock_market_server::MockMarketServer;
