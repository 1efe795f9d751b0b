//! Inline admin pages, shared by the device and host targets. Values are
//! substituted into `%TOKEN%` placeholders server-side.

use redlight_common::{DeviceCodeSession, DeviceConfig, Pattern};

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Teams Red Light</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; background-color: #f5f5f5; }
        .container { max-width: 600px; margin: 0 auto; background: white; padding: 20px; border-radius: 10px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
        h1 { color: #d73502; text-align: center; }
        .status { padding: 15px; margin: 10px 0; border-radius: 5px; text-align: center; font-weight: bold; }
        .status.connected { background-color: #d4edda; color: #155724; }
        .status.disconnected { background-color: #f8d7da; color: #721c24; }
        .status.configuring { background-color: #fff3cd; color: #856404; }
        button { background-color: #d73502; color: white; padding: 10px 20px; border: none; border-radius: 5px; cursor: pointer; margin: 5px; }
        button:hover { background-color: #b12d02; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Teams Red Light</h1>
        <div id="status" class="status configuring">Loading status...</div>
        <div>
            <button onclick="window.location.href='/config'">Configure Device</button>
            <button onclick="window.location.href='/login'">Sign in with Microsoft</button>
            <button onclick="checkStatus()">Refresh Status</button>
            <button onclick="restartDevice()">Restart Device</button>
        </div>
    </div>
    <script>
        function checkStatus() {
            fetch('/status')
                .then(response => response.json())
                .then(data => {
                    const statusDiv = document.getElementById('status');
                    if (data.state === 'monitoring') {
                        statusDiv.className = 'status connected';
                        statusDiv.innerHTML = 'Connected - Presence: ' + data.presence;
                    } else if (data.state === 'ap_mode') {
                        statusDiv.className = 'status configuring';
                        statusDiv.innerHTML = 'Configuration Mode - Please configure WiFi and Teams settings';
                    } else {
                        statusDiv.className = 'status disconnected';
                        statusDiv.innerHTML = data.message || 'Not connected';
                    }
                })
                .catch(() => {
                    document.getElementById('status').innerHTML = 'Unable to get status';
                });
        }
        function restartDevice() {
            if (confirm('Are you sure you want to restart the device?')) {
                fetch('/restart', { method: 'POST' })
                    .then(() => {
                        alert('Device is restarting...');
                        setTimeout(() => location.reload(), 5000);
                    });
            }
        }
        checkStatus();
        setInterval(checkStatus, 10000);
    </script>
</body>
</html>
"#;

const CONFIG_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Teams Red Light - Configuration</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; background-color: #f5f5f5; }
        .container { max-width: 600px; margin: 0 auto; background: white; padding: 20px; border-radius: 10px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
        h1 { color: #d73502; text-align: center; }
        .form-group { margin: 15px 0; }
        label { display: block; margin-bottom: 5px; font-weight: bold; }
        input, select { width: 100%; padding: 8px; border: 1px solid #ddd; border-radius: 4px; box-sizing: border-box; }
        button { background-color: #d73502; color: white; padding: 10px 20px; border: none; border-radius: 5px; cursor: pointer; margin: 5px; }
        button:hover { background-color: #b12d02; }
        .section { margin: 20px 0; padding: 15px; border: 1px solid #ddd; border-radius: 5px; }
        .help { font-size: 0.9em; color: #666; margin-top: 5px; }
        .led-row { display: flex; gap: 10px; }
        .led-row > div { flex: 1; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Teams Red Light Configuration</h1>
        <form action="/save" method="POST">
            <div class="section">
                <h3>WiFi Settings</h3>
                <div class="form-group">
                    <label for="wifi_ssid">WiFi Network Name (SSID):</label>
                    <input type="text" id="wifi_ssid" name="wifi_ssid" value="%WIFI_SSID%" required>
                </div>
                <div class="form-group">
                    <label for="wifi_password">WiFi Password:</label>
                    <input type="password" id="wifi_password" name="wifi_password" value="">
                    <div class="help">Leave blank to keep current password</div>
                </div>
            </div>
            <div class="section">
                <h3>Microsoft Teams/Office 365 Settings</h3>
                <div class="form-group">
                    <label for="user_email">Your Email Address:</label>
                    <input type="email" id="user_email" name="user_email" value="%USER_EMAIL%">
                </div>
                <div class="form-group">
                    <label for="tenant_id">Tenant ID:</label>
                    <input type="text" id="tenant_id" name="tenant_id" value="%TENANT_ID%">
                    <div class="help">Your Office 365 tenant ID (can be 'common' for personal accounts)</div>
                </div>
                <div class="form-group">
                    <label for="client_id">Client ID:</label>
                    <input type="text" id="client_id" name="client_id" value="%CLIENT_ID%" required>
                    <div class="help">Azure AD Application Client ID</div>
                </div>
                <div class="form-group">
                    <label for="client_secret">Client Secret:</label>
                    <input type="password" id="client_secret" name="client_secret" value="">
                    <div class="help">Only needed for confidential clients; leave blank to keep current</div>
                </div>
            </div>
            <div class="section">
                <h3>LEDs</h3>
                <div class="form-group">
                    <label for="led_count">Number of LEDs (1-8):</label>
                    <input type="number" id="led_count" name="led_count" min="1" max="8" value="%LED_COUNT%">
                    <div class="help">Save to add rows for new LEDs</div>
                </div>
                %LED_ROWS%
            </div>
            <div class="section">
                <h3>Firmware Update</h3>
                <div class="form-group">
                    <label for="ota_url">OTA Update URL:</label>
                    <input type="text" id="ota_url" name="ota_url" value="%OTA_URL%">
                </div>
            </div>
            <button type="submit">Save Configuration</button>
            <button type="button" onclick="window.location.href='/'">Back to Home</button>
        </form>
        <div class="section">
            <h3>Setup Instructions</h3>
            <ol>
                <li>Register an application in Azure AD with the <code>Presence.Read</code> delegated permission</li>
                <li>Enable "Allow public client flows" on the application</li>
                <li>Enter your application credentials above and save</li>
                <li>Click "Sign in with Microsoft" on the home page and enter the code shown</li>
            </ol>
        </div>
    </div>
</body>
</html>
"#;

const LED_ROW_TEMPLATE: &str = r#"<div class="led-row">
    <div><label>GPIO pin</label><input type="number" name="led%I%_pin" value="%PIN%"></div>
    <div><label>Busy</label><select name="led%I%_busy">%BUSY_OPTIONS%</select></div>
    <div><label>In meeting</label><select name="led%I%_meeting">%MEETING_OPTIONS%</select></div>
    <div><label>Otherwise</label><select name="led%I%_idle">%IDLE_OPTIONS%</select></div>
    <div><label>Enabled</label><select name="led%I%_enabled"><option value="1"%EN_ON%>Yes</option><option value="0"%EN_OFF%>No</option></select></div>
</div>
"#;

pub const SAVED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Configuration Saved</title>
    <meta http-equiv="refresh" content="3;url=/">
    <style>
        body { font-family: Arial, sans-serif; text-align: center; margin-top: 50px; }
        .message { background-color: #d4edda; color: #155724; padding: 20px; border-radius: 5px; display: inline-block; }
    </style>
</head>
<body>
    <div class="message">
        <h2>Configuration Saved!</h2>
        <p>The device will restart and connect to the new network...</p>
        <p>You will be redirected to the home page in 3 seconds.</p>
    </div>
</body>
</html>
"#;

const LOGIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Sign in with Microsoft</title>
    <meta charset="UTF-8">
    <style>
        body { font-family: Arial, sans-serif; text-align: center; margin-top: 50px; }
        .message { background-color: #fff3cd; color: #856404; padding: 20px; border-radius: 5px; display: inline-block; }
        .code { font-size: 2em; font-weight: bold; letter-spacing: 0.2em; margin: 15px 0; }
    </style>
</head>
<body>
    <div class="message">
        <h2>Almost there</h2>
        <p>On another device, open <a href="%VERIFICATION_URI%">%VERIFICATION_URI%</a> and enter:</p>
        <div class="code">%USER_CODE%</div>
        <p>The code expires in %EXPIRES_MIN% minutes. This light keeps polling in the background;
        once you approve, it starts monitoring your presence.</p>
        <p><a href="/">Back to home</a></p>
    </div>
</body>
</html>
"#;

pub fn config_page(config: &DeviceConfig) -> String {
    let mut rows = String::new();
    for (index, led) in config.leds.iter().enumerate() {
        rows.push_str(
            &LED_ROW_TEMPLATE
                .replace("%I%", &index.to_string())
                .replace("%PIN%", &led.pin.to_string())
                .replace("%BUSY_OPTIONS%", &pattern_options(led.busy_pattern))
                .replace("%MEETING_OPTIONS%", &pattern_options(led.meeting_pattern))
                .replace("%IDLE_OPTIONS%", &pattern_options(led.idle_pattern))
                .replace("%EN_ON%", if led.enabled { " selected" } else { "" })
                .replace("%EN_OFF%", if led.enabled { "" } else { " selected" }),
        );
    }

    CONFIG_TEMPLATE
        .replace("%WIFI_SSID%", &escape_html(&config.wifi_ssid))
        .replace("%USER_EMAIL%", &escape_html(&config.user_email))
        .replace("%TENANT_ID%", &escape_html(&config.tenant_id))
        .replace("%CLIENT_ID%", &escape_html(&config.client_id))
        .replace("%OTA_URL%", &escape_html(&config.ota_url))
        .replace("%LED_COUNT%", &config.leds.len().to_string())
        .replace("%LED_ROWS%", &rows)
}

pub fn login_page(session: &DeviceCodeSession, wall_ms: u64) -> String {
    let expires_min = session.expires_at_ms.saturating_sub(wall_ms) / 60_000;
    LOGIN_TEMPLATE
        .replace("%VERIFICATION_URI%", &escape_html(&session.verification_uri))
        .replace("%USER_CODE%", &escape_html(&session.user_code))
        .replace("%EXPIRES_MIN%", &expires_min.to_string())
}

fn pattern_options(selected: Pattern) -> String {
    const LABELS: [(Pattern, &str); 7] = [
        (Pattern::Off, "Off"),
        (Pattern::Solid, "Solid"),
        (Pattern::SlowBlink, "Slow blink"),
        (Pattern::MediumBlink, "Medium blink"),
        (Pattern::FastBlink, "Fast blink"),
        (Pattern::DoubleBlink, "Double blink"),
        (Pattern::DimSolid, "Dim solid"),
    ];

    let mut options = String::new();
    for (pattern, label) in LABELS {
        let marker = if pattern == selected { " selected" } else { "" };
        options.push_str(&format!(
            r#"<option value="{}"{marker}>{label}</option>"#,
            pattern.code()
        ));
    }
    options
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
