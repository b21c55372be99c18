mod signaling_tests;
